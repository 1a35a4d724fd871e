use thiserror::Error;

/// Failures surfaced by a store operation.
///
/// Degraded dual-mode writes and sidecar failures are not errors: the first
/// is reported on the outcome, the second is only logged.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Payload is not valid JSON
    #[error("invalid JSON input: {0}")]
    InvalidInput(String),

    /// Payload exceeds the intake ceiling
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    /// No configured persistence path accepted the write
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Router wired with a mode its clients cannot satisfy
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected local fault (staging, directory scan)
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::InvalidInput(_) => "INVALID_INPUT",
            StorageError::TooLarge { .. } => "PAYLOAD_TOO_LARGE",
            StorageError::Persistence(_) => "PERSISTENCE_ERROR",
            StorageError::Configuration(_) => "CONFIGURATION_ERROR",
            StorageError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Persistence(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidInput(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Internal(err.to_string())
    }
}
