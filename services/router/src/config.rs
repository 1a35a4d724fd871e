use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the router service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Local storage layout and persistence mode
    #[serde(default)]
    pub storage: StorageConfig,
    /// Content classifier thresholds
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// S3 configuration (required when the mode persists remotely)
    pub s3: Option<S3Config>,
    /// Document store configuration (optional)
    pub database: Option<DatabaseConfig>,
    /// HTTP intake configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Where uploads are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[serde(alias = "local")]
    LocalOnly,
    #[serde(alias = "online", alias = "remote")]
    RemoteOnly,
    Both,
}

impl StorageMode {
    pub fn stores_locally(self) -> bool {
        matches!(self, StorageMode::LocalOnly | StorageMode::Both)
    }

    pub fn stores_remotely(self) -> bool {
        matches!(self, StorageMode::RemoteOnly | StorageMode::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StorageMode::LocalOnly => "local-only",
            StorageMode::RemoteOnly => "remote-only",
            StorageMode::Both => "both",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local storage layout
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Persistence mode
    #[serde(default = "default_storage_mode")]
    pub mode: StorageMode,
    /// Directory for row-oriented documents
    #[serde(default = "default_row_dir")]
    pub row_dir: PathBuf,
    /// Directory for document-oriented documents
    #[serde(default = "default_document_dir")]
    pub document_dir: PathBuf,
    /// Directory for schema sidecars
    #[serde(default = "default_schema_dir")]
    pub schema_dir: PathBuf,
    /// Staging area for uploads in flight
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Hard cap on a single upload (50MB default)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Top-level remote folder; buckets are nested beneath it
    #[serde(default = "default_remote_folder")]
    pub remote_folder: String,
    /// Staged files older than this are swept by cleanup
    #[serde(default = "default_temp_max_age_secs")]
    pub temp_max_age_secs: u64,
}

/// Classification thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Inputs larger than this skip structural inspection (10MB default)
    #[serde(default = "default_max_analysis_bytes")]
    pub max_analysis_bytes: usize,
    /// Number of array elements sampled
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Hard column limit for row-oriented arrays
    #[serde(default = "default_max_columns")]
    pub max_columns: usize,
    /// Arrays with at most this many columns qualify without an id column
    #[serde(default = "default_small_table_columns")]
    pub small_table_columns: usize,
    /// Nesting depth at which a document becomes document-oriented
    #[serde(default = "default_nesting_threshold")]
    pub nesting_threshold: u32,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL used to build object locations; `s3://bucket/key` otherwise
    pub public_base_url: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// HTTP intake configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Concurrent stores per bulk upload
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

// Default value functions
fn default_service_name() -> String {
    "router-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_storage_mode() -> StorageMode {
    StorageMode::LocalOnly
}

fn default_row_dir() -> PathBuf {
    PathBuf::from("storage/databases/row-oriented")
}

fn default_document_dir() -> PathBuf {
    PathBuf::from("storage/databases/document-oriented")
}

fn default_schema_dir() -> PathBuf {
    PathBuf::from("storage/internal/schemas")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("storage/temp")
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024 // 50MB
}

fn default_remote_folder() -> String {
    "json".to_string()
}

fn default_temp_max_age_secs() -> u64 {
    3600
}

fn default_max_analysis_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_sample_size() -> usize {
    10
}

fn default_max_columns() -> usize {
    50
}

fn default_small_table_columns() -> usize {
    20
}

fn default_nesting_threshold() -> u32 {
    1
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_upload_concurrency() -> usize {
    4
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/router").required(false))
            .add_source(config::File::with_name("/etc/router/router").required(false))
            // Override with environment variables
            // ROUTER__STORAGE__MODE -> storage.mode
            .add_source(
                config::Environment::with_prefix("ROUTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that can only fail at request time
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.mode.stores_remotely() && self.s3.is_none() {
            anyhow::bail!(
                "storage mode `{}` persists remotely but no [s3] section is configured",
                self.storage.mode
            );
        }
        if self.storage.max_upload_bytes == 0 {
            anyhow::bail!("storage.max_upload_bytes must be positive");
        }
        if self.classifier.sample_size == 0 {
            anyhow::bail!("classifier.sample_size must be positive");
        }
        Ok(())
    }
}

impl StorageConfig {
    /// Age after which a staged upload counts as abandoned
    pub fn temp_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_max_age_secs)
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: default_storage_mode(),
            row_dir: default_row_dir(),
            document_dir: default_document_dir(),
            schema_dir: default_schema_dir(),
            temp_dir: default_temp_dir(),
            max_upload_bytes: default_max_upload_bytes(),
            remote_folder: default_remote_folder(),
            temp_max_age_secs: default_temp_max_age_secs(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_analysis_bytes: default_max_analysis_bytes(),
            sample_size: default_sample_size(),
            max_columns: default_max_columns(),
            small_table_columns: default_small_table_columns(),
            nesting_threshold: default_nesting_threshold(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            upload_concurrency: default_upload_concurrency(),
        }
    }
}
