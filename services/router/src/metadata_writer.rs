use crate::classifier::{AnalysisResult, Bucket};
use crate::fingerprint::Fingerprint;
use crate::local_store::{stored_stem, META_SUFFIX, SCHEMA_SUFFIX};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Analysis sidecar stored next to each data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarMetadata {
    pub original_filename: String,
    pub analysis: AnalysisResult,
    pub analyzed_at: DateTime<Utc>,
    pub file_size: u64,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub remote_location: Option<String>,
}

/// Schema sidecar stored in the schema directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub original_filename: String,
    pub storage_type: Bucket,
    pub columns: Vec<String>,
    pub reason: String,
    pub analyzed_at: DateTime<Utc>,
}

/// Writes and reads the sidecars of locally stored documents
#[derive(Debug, Clone)]
pub struct MetadataWriter {
    schema_dir: PathBuf,
}

impl MetadataWriter {
    pub fn new(schema_dir: impl Into<PathBuf>) -> Self {
        Self {
            schema_dir: schema_dir.into(),
        }
    }

    /// Write both sidecars for a stored file.
    ///
    /// Best-effort: failures are logged and counted, never returned. Returns
    /// whether both sidecars were written.
    #[instrument(skip(self, analysis, fingerprint), fields(stored = %stored_location.display()))]
    pub async fn write_sidecar(
        &self,
        stored_location: &Path,
        analysis: &AnalysisResult,
        original_filename: &str,
        remote_location: Option<&str>,
        fingerprint: &Fingerprint,
    ) -> bool {
        match self
            .try_write(
                stored_location,
                analysis,
                original_filename,
                remote_location,
                fingerprint,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Sidecar write failed; stored file kept");
                metrics::counter!("router.sidecar.failed").increment(1);
                false
            }
        }
    }

    async fn try_write(
        &self,
        stored_location: &Path,
        analysis: &AnalysisResult,
        original_filename: &str,
        remote_location: Option<&str>,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let analyzed_at = Utc::now();
        let file_size = tokio::fs::metadata(stored_location)
            .await
            .context("Failed to stat stored file")?
            .len();

        let sidecar = SidecarMetadata {
            original_filename: original_filename.to_string(),
            analysis: analysis.clone(),
            analyzed_at,
            file_size,
            fingerprint: fingerprint.clone(),
            remote_location: remote_location.map(String::from),
        };
        let meta_path = meta_path(stored_location);
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&sidecar)?)
            .await
            .context("Failed to write metadata sidecar")?;

        let schema = SchemaRecord {
            original_filename: original_filename.to_string(),
            storage_type: analysis.recommendation,
            columns: analysis.column_names().to_vec(),
            reason: analysis.reason.clone(),
            analyzed_at,
        };
        let schema_path = self.schema_path(stored_location);
        tokio::fs::create_dir_all(&self.schema_dir)
            .await
            .context("Failed to create schema directory")?;
        tokio::fs::write(&schema_path, serde_json::to_vec_pretty(&schema)?)
            .await
            .context("Failed to write schema sidecar")?;

        debug!(
            meta = %meta_path.display(),
            schema = %schema_path.display(),
            "Sidecars written"
        );

        Ok(())
    }

    pub fn schema_path(&self, stored_location: &Path) -> PathBuf {
        self.schema_dir
            .join(format!("{}{}", file_stem(stored_location), SCHEMA_SUFFIX))
    }
}

/// Read the analysis sidecar of a stored file
pub async fn read_sidecar(stored_location: &Path) -> Result<SidecarMetadata> {
    let bytes = tokio::fs::read(meta_path(stored_location))
        .await
        .context("Failed to read metadata sidecar")?;
    serde_json::from_slice(&bytes).context("Malformed metadata sidecar")
}

/// `{stem}.meta.json` beside the stored file
pub fn meta_path(stored_location: &Path) -> PathBuf {
    let name = format!("{}{}", file_stem(stored_location), META_SUFFIX);
    match stored_location.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

fn file_stem(stored_location: &Path) -> &str {
    stored_location
        .file_name()
        .and_then(|n| n.to_str())
        .map(stored_stem)
        .unwrap_or_default()
}
