use crate::classifier::Bucket;
use crate::config::StorageConfig;
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Suffix of the analysis sidecar kept next to each data file
pub const META_SUFFIX: &str = ".meta.json";
/// Suffix of the schema sidecar kept in the schema directory
pub const SCHEMA_SUFFIX: &str = ".schema.json";

/// Local bucket directories plus the staging area for uploads in flight
#[derive(Debug, Clone)]
pub struct LocalStore {
    row_dir: PathBuf,
    document_dir: PathBuf,
    schema_dir: PathBuf,
    temp_dir: PathBuf,
}

impl LocalStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            row_dir: config.row_dir.clone(),
            document_dir: config.document_dir.clone(),
            schema_dir: config.schema_dir.clone(),
            temp_dir: config.temp_dir.clone(),
        }
    }

    /// Lay out every directory under a single root
    pub fn under(root: &Path) -> Self {
        Self {
            row_dir: root.join(Bucket::RowOriented.as_str()),
            document_dir: root.join(Bucket::DocumentOriented.as_str()),
            schema_dir: root.join("schemas"),
            temp_dir: root.join("temp"),
        }
    }

    pub fn bucket_dir(&self, bucket: Bucket) -> &Path {
        match bucket {
            Bucket::RowOriented => &self.row_dir,
            Bucket::DocumentOriented => &self.document_dir,
        }
    }

    pub fn schema_dir(&self) -> &Path {
        &self.schema_dir
    }

    /// Create all directories if missing
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            &self.row_dir,
            &self.document_dir,
            &self.schema_dir,
            &self.temp_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        info!(
            row_dir = %self.row_dir.display(),
            document_dir = %self.document_dir.display(),
            "Local storage directories ready"
        );

        Ok(())
    }

    /// Write an upload into the staging area under a unique name
    pub async fn stage(&self, bytes: &[u8], original_name: &str) -> io::Result<StagedUpload> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let file_name = format!("{}_{}", Uuid::new_v4(), sanitize_file_name(original_name));
        let path = self.temp_dir.join(file_name);
        // Guard exists before the write so a partial file is still removed.
        let staged = StagedUpload {
            path,
            removed: false,
        };
        tokio::fs::write(&staged.path, bytes).await?;

        debug!(path = %staged.path.display(), size_bytes = bytes.len(), "Upload staged");
        Ok(staged)
    }

    /// Copy a staged upload into its bucket directory
    pub async fn persist(
        &self,
        staged: &StagedUpload,
        bucket: Bucket,
        stored_name: &str,
    ) -> io::Result<PathBuf> {
        let dir = self.bucket_dir(bucket);
        tokio::fs::create_dir_all(dir).await?;

        let destination = dir.join(stored_name);
        if let Err(e) = tokio::fs::copy(&staged.path, &destination).await {
            // Leave no partial data file behind for the duplicate scan to find.
            let _ = tokio::fs::remove_file(&destination).await;
            return Err(e);
        }

        Ok(destination)
    }

    /// Data file count and bytes per bucket; sidecars are not counted
    pub async fn bucket_stats(&self) -> io::Result<Vec<BucketStats>> {
        let mut stats = Vec::with_capacity(2);

        for bucket in [Bucket::RowOriented, Bucket::DocumentOriented] {
            let mut bucket_stats = BucketStats {
                bucket,
                file_count: 0,
                total_bytes: 0,
            };

            let mut entries = match tokio::fs::read_dir(self.bucket_dir(bucket)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    stats.push(bucket_stats);
                    continue;
                }
                Err(e) => return Err(e),
            };

            while let Some(entry) = entries.next_entry().await? {
                let is_data = entry
                    .file_name()
                    .to_str()
                    .map(|name| !is_sidecar(name))
                    .unwrap_or(false);
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                if is_data && metadata.is_file() {
                    bucket_stats.file_count += 1;
                    bucket_stats.total_bytes += metadata.len();
                }
            }

            stats.push(bucket_stats);
        }

        Ok(stats)
    }

    /// Remove staged files last modified at least `min_age` ago, such as
    /// those a crashed process left behind
    pub async fn sweep_temp(&self, min_age: Duration) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            // Entry may vanish under a concurrent discard.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata.modified()?.elapsed().unwrap_or_default();
            if age < min_age {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        if removed > 0 {
            info!(removed = removed, "Swept abandoned staged uploads");
        }

        Ok(removed)
    }
}

/// Data files held by one local bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub bucket: Bucket,
    pub file_count: u64,
    pub total_bytes: u64,
}

/// An upload written to the staging area.
///
/// The file is removed by [`StagedUpload::discard`] or, failing that, when the
/// value is dropped.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
    removed: bool,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn discard(mut self) -> io::Result<()> {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staged upload");
            }
        }
    }
}

/// Stored name: `{stem}_{YYYYmmdd_HHMMSS}_{hash8}{ext}`
pub fn derive_stored_name(
    original_name: &str,
    stored_at: DateTime<Utc>,
    fingerprint: &Fingerprint,
) -> String {
    let (stem, extension) = split_name(original_name);
    format!(
        "{stem}_{timestamp}_{hash}{extension}",
        stem = stem,
        timestamp = stored_at.format("%Y%m%d_%H%M%S"),
        hash = fingerprint.short(),
        extension = extension
    )
}

/// Sanitized stem and dotted extension of an uploaded filename
fn split_name(original_name: &str) -> (String, String) {
    let path = Path::new(original_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(sanitize_path_component)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "upload".to_string());
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", sanitize_path_component(e)))
        .unwrap_or_default();
    (stem, extension)
}

fn sanitize_file_name(original_name: &str) -> String {
    let (stem, extension) = split_name(original_name);
    format!("{}{}", stem, extension)
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Whether a bucket entry is a sidecar rather than a data file
pub fn is_sidecar(file_name: &str) -> bool {
    file_name.ends_with(META_SUFFIX) || file_name.ends_with(SCHEMA_SUFFIX)
}

/// Stem of a stored name, used to key its sidecars
pub fn stored_stem(stored_name: &str) -> &str {
    Path::new(stored_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(stored_name)
}
