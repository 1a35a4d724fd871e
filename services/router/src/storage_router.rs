use crate::classifier::{AnalysisResult, Bucket, Classifier, ClassifierBuilder};
use crate::config::{Config, StorageMode};
use crate::dedup::{DuplicateDetector, StoredRecord};
use crate::error::StorageError;
use crate::fingerprint::Fingerprint;
use crate::local_store::{derive_stored_name, BucketStats, LocalStore, StagedUpload};
use crate::metadata_writer::MetadataWriter;
use crate::remote::{bucket_folder, RemoteBlobStore, RemoteDocumentStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_REMOTE_FOLDER: &str = "json";
const DEFAULT_STAGING_MAX_AGE: Duration = Duration::from_secs(3600);

/// A persistence path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Local,
    Remote,
}

impl Leg {
    pub fn as_str(self) -> &'static str {
        match self {
            Leg::Local => "local",
            Leg::Remote => "remote",
        }
    }
}

/// One of two configured legs failed while the other succeeded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedLeg {
    pub leg: Leg,
    pub error: String,
}

/// Result of one store operation, identical in shape for every mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreOutcome {
    /// Always `true`; failed stores are returned as `Err(StorageError)`
    pub success: bool,
    pub original_name: String,
    pub stored_name: String,
    pub bucket: Bucket,
    pub local_location: Option<PathBuf>,
    pub remote_location: Option<String>,
    pub reason: String,
    pub fingerprint: Fingerprint,
    pub timestamp: DateTime<Utc>,
    pub duplicate: bool,
    pub degraded: Option<DegradedLeg>,
    pub analysis: AnalysisResult,
}

impl StoreOutcome {
    fn from_duplicate(record: StoredRecord, original_name: &str, analysis: AnalysisResult) -> Self {
        Self {
            success: true,
            original_name: original_name.to_string(),
            stored_name: record.stored_name,
            bucket: record.bucket,
            local_location: record.local_location,
            remote_location: record.remote_location,
            reason: analysis.reason.clone(),
            fingerprint: record.fingerprint,
            timestamp: record.stored_at,
            duplicate: true,
            degraded: None,
            analysis,
        }
    }
}

/// Routes uploaded JSON to the bucket its structure calls for.
///
/// Each store runs classify, fingerprint, duplicate check, persist, sidecar
/// write and staging cleanup in that order. Concurrent stores of identical
/// content may both pass the duplicate check; the timestamped names keep the
/// second write harmless.
pub struct StorageRouter {
    mode: StorageMode,
    classifier: Classifier,
    local: LocalStore,
    detector: DuplicateDetector,
    metadata: MetadataWriter,
    blob_store: Option<Arc<dyn RemoteBlobStore>>,
    document_store: Option<Arc<dyn RemoteDocumentStore>>,
    remote_folder: String,
    max_upload_bytes: usize,
    staging_max_age: Duration,
}

impl StorageRouter {
    pub fn builder(mode: StorageMode, local: LocalStore) -> StorageRouterBuilder {
        StorageRouterBuilder {
            mode,
            local,
            classifier: ClassifierBuilder::new().build(),
            blob_store: None,
            document_store: None,
            remote_folder: DEFAULT_REMOTE_FOLDER.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            staging_max_age: DEFAULT_STAGING_MAX_AGE,
        }
    }

    /// Wire a router from loaded configuration and already-built clients
    pub fn from_config(
        config: &Config,
        blob_store: Option<Arc<dyn RemoteBlobStore>>,
        document_store: Option<Arc<dyn RemoteDocumentStore>>,
    ) -> Result<Self, StorageError> {
        let mut builder = Self::builder(config.storage.mode, LocalStore::new(&config.storage))
            .classifier(Classifier::new(config.classifier.clone()))
            .remote_folder(config.storage.remote_folder.clone())
            .max_upload_bytes(config.storage.max_upload_bytes)
            .staging_max_age(config.storage.temp_max_age());

        if let Some(store) = blob_store {
            builder = builder.blob_store(store);
        }
        if let Some(store) = document_store {
            builder = builder.document_store(store);
        }

        builder.build()
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Data file count and bytes held by each local bucket
    pub async fn stats(&self) -> Result<Vec<BucketStats>, StorageError> {
        Ok(self.local.bucket_stats().await?)
    }

    /// Remove abandoned staged uploads older than the configured age
    #[instrument(skip(self))]
    pub async fn sweep_staging(&self) -> Result<usize, StorageError> {
        let removed = self.local.sweep_temp(self.staging_max_age).await?;
        metrics::counter!("router.staging.swept").increment(removed as u64);
        Ok(removed)
    }

    /// Classify, deduplicate and persist one uploaded JSON document
    #[instrument(skip(self, raw_bytes), fields(size_bytes = raw_bytes.len(), mode = %self.mode))]
    pub async fn store(
        &self,
        raw_bytes: &[u8],
        original_name: &str,
    ) -> Result<StoreOutcome, StorageError> {
        if raw_bytes.len() > self.max_upload_bytes {
            return Err(StorageError::TooLarge {
                size: raw_bytes.len(),
                limit: self.max_upload_bytes,
            });
        }

        let started = Instant::now();
        let staged = self.local.stage(raw_bytes, original_name).await?;

        let result = self.route(&staged, raw_bytes, original_name).await;

        if let Err(e) = staged.discard().await {
            warn!(error = %e, "Failed to remove staged upload");
        }

        metrics::histogram!("router.store.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => info!(
                stored_name = %outcome.stored_name,
                bucket = %outcome.bucket,
                duplicate = outcome.duplicate,
                "Upload routed"
            ),
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "Upload failed");
                metrics::counter!("router.uploads.failed").increment(1);
            }
        }

        result
    }

    async fn route(
        &self,
        staged: &StagedUpload,
        raw_bytes: &[u8],
        original_name: &str,
    ) -> Result<StoreOutcome, StorageError> {
        let (value, analysis, fingerprint) = self.analyze(raw_bytes).await?;
        let bucket = analysis.recommendation;

        debug!(
            bucket = %bucket,
            reason = %analysis.reason,
            fingerprint = %fingerprint.short(),
            "Content classified"
        );

        if let Some(record) = self.detector.find_duplicate(&fingerprint, bucket).await? {
            metrics::counter!("router.uploads.duplicate").increment(1);
            return Ok(StoreOutcome::from_duplicate(record, original_name, analysis));
        }

        let stored_at = Utc::now();
        let stored_name = derive_stored_name(original_name, stored_at, &fingerprint);

        let local = if self.mode.stores_locally() {
            Some(
                self.local
                    .persist(staged, bucket, &stored_name)
                    .await
                    .map_err(|e| e.to_string()),
            )
        } else {
            None
        };
        let remote = if self.mode.stores_remotely() {
            Some(self.persist_remote(raw_bytes, bucket, &stored_name).await)
        } else {
            None
        };

        let (local_location, remote_location, degraded) = resolve_legs(local, remote)?;

        if let Some(ref degraded) = degraded {
            warn!(
                leg = degraded.leg.as_str(),
                error = %degraded.error,
                "Stored in degraded mode"
            );
            metrics::counter!("router.uploads.degraded", "leg" => degraded.leg.as_str())
                .increment(1);
        }

        if let Some(ref path) = local_location {
            self.metadata
                .write_sidecar(
                    path,
                    &analysis,
                    original_name,
                    remote_location.as_deref(),
                    &fingerprint,
                )
                .await;
        }

        if let Some(ref documents) = self.document_store {
            let document = json!({
                "original_filename": original_name,
                "stored_name": stored_name,
                "fingerprint": fingerprint,
                "analysis": analysis,
                "remote_location": remote_location,
                "stored_at": stored_at,
                "content": value,
            });
            if let Err(e) = documents
                .upsert(bucket.as_str(), fingerprint.as_str(), &document)
                .await
            {
                warn!(error = %format!("{:#}", e), "Document record upsert failed");
                metrics::counter!("router.documents.failed").increment(1);
            }
        }

        metrics::counter!("router.uploads.stored", "bucket" => bucket.as_str()).increment(1);
        metrics::counter!("router.bytes.stored").increment(raw_bytes.len() as u64);

        Ok(StoreOutcome {
            success: true,
            original_name: original_name.to_string(),
            stored_name,
            bucket,
            local_location,
            remote_location,
            reason: analysis.reason.clone(),
            fingerprint,
            timestamp: stored_at,
            duplicate: false,
            degraded,
            analysis,
        })
    }

    /// Parse, classify and fingerprint on the blocking pool
    async fn analyze(
        &self,
        raw_bytes: &[u8],
    ) -> Result<(Value, AnalysisResult, Fingerprint), StorageError> {
        let classifier = self.classifier.clone();
        let bytes: Arc<[u8]> = Arc::from(raw_bytes);

        tokio::task::spawn_blocking(move || -> Result<_, StorageError> {
            let value: Value = serde_json::from_slice(&bytes)?;
            let analysis = classifier.classify(&value, bytes.len());
            let fingerprint = Fingerprint::of(&bytes);
            Ok((value, analysis, fingerprint))
        })
        .await
        .map_err(|e| StorageError::Internal(format!("analysis task failed: {}", e)))?
    }

    async fn persist_remote(
        &self,
        raw_bytes: &[u8],
        bucket: Bucket,
        stored_name: &str,
    ) -> Result<String, String> {
        let Some(ref store) = self.blob_store else {
            return Err("no remote blob store configured".to_string());
        };

        store
            .put_raw(raw_bytes, stored_name, &bucket_folder(&self.remote_folder, bucket))
            .await
            .map(|blob| blob.location)
            .map_err(|e| format!("{:#}", e))
    }
}

type LegResult<T> = Option<Result<T, String>>;

/// Fold the per-leg results into locations, failing only when nothing persisted
fn resolve_legs(
    local: LegResult<PathBuf>,
    remote: LegResult<String>,
) -> Result<(Option<PathBuf>, Option<String>, Option<DegradedLeg>), StorageError> {
    match (local, remote) {
        (Some(Ok(path)), Some(Ok(location))) => Ok((Some(path), Some(location), None)),
        (Some(Ok(path)), None) => Ok((Some(path), None, None)),
        (None, Some(Ok(location))) => Ok((None, Some(location), None)),
        (Some(Ok(path)), Some(Err(error))) => Ok((
            Some(path),
            None,
            Some(DegradedLeg {
                leg: Leg::Remote,
                error,
            }),
        )),
        (Some(Err(error)), Some(Ok(location))) => Ok((
            None,
            Some(location),
            Some(DegradedLeg {
                leg: Leg::Local,
                error,
            }),
        )),
        (Some(Err(error)), None) => Err(StorageError::Persistence(format!(
            "local write failed: {}",
            error
        ))),
        (None, Some(Err(error))) => Err(StorageError::Persistence(format!(
            "remote upload failed: {}",
            error
        ))),
        (Some(Err(local)), Some(Err(remote))) => Err(StorageError::Persistence(format!(
            "local write failed: {}; remote upload failed: {}",
            local, remote
        ))),
        (None, None) => Err(StorageError::Configuration(
            "storage mode selects no persistence path".to_string(),
        )),
    }
}

/// Builder for wiring a StorageRouter with injected clients
pub struct StorageRouterBuilder {
    mode: StorageMode,
    local: LocalStore,
    classifier: Classifier,
    blob_store: Option<Arc<dyn RemoteBlobStore>>,
    document_store: Option<Arc<dyn RemoteDocumentStore>>,
    remote_folder: String,
    max_upload_bytes: usize,
    staging_max_age: Duration,
}

impl StorageRouterBuilder {
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn blob_store(mut self, store: Arc<dyn RemoteBlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    pub fn document_store(mut self, store: Arc<dyn RemoteDocumentStore>) -> Self {
        self.document_store = Some(store);
        self
    }

    pub fn remote_folder(mut self, folder: impl Into<String>) -> Self {
        self.remote_folder = folder.into();
        self
    }

    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn staging_max_age(mut self, age: Duration) -> Self {
        self.staging_max_age = age;
        self
    }

    pub fn build(self) -> Result<StorageRouter, StorageError> {
        if self.mode.stores_remotely() && self.blob_store.is_none() {
            return Err(StorageError::Configuration(format!(
                "storage mode `{}` requires a remote blob store",
                self.mode
            )));
        }

        let detector = match self.blob_store {
            Some(ref store) if !self.mode.stores_locally() => {
                DuplicateDetector::remote(store.clone(), self.remote_folder.clone())
            }
            _ => DuplicateDetector::local(self.local.clone()),
        };

        Ok(StorageRouter {
            mode: self.mode,
            classifier: self.classifier,
            metadata: MetadataWriter::new(self.local.schema_dir()),
            local: self.local,
            detector,
            blob_store: self.blob_store,
            document_store: self.document_store,
            remote_folder: self.remote_folder,
            max_upload_bytes: self.max_upload_bytes,
            staging_max_age: self.staging_max_age,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_writer::read_sidecar;
    use crate::remote::{
        object_key, BlobLocation, MockRemoteBlobStore, MockRemoteDocumentStore, UpsertOutcome,
    };
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const FLAT: &[u8] = br#"{"id":1,"name":"Ann"}"#;
    const NESTED: &[u8] = br#"{"id":1,"profile":{"age":25}}"#;

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    fn local_router(root: &TempDir) -> StorageRouter {
        StorageRouter::builder(StorageMode::LocalOnly, LocalStore::under(root.path()))
            .build()
            .unwrap()
    }

    /// Blob store mock that records uploads and serves them back
    fn recording_blob_store() -> MockRemoteBlobStore {
        let uploaded: Arc<Mutex<Vec<(BlobLocation, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockRemoteBlobStore::new();

        let sink = uploaded.clone();
        store.expect_put_raw().returning(move |bytes, key, folder| {
            let key = object_key(folder, key);
            let blob = BlobLocation {
                location: format!("s3://test/{}", key),
                key,
            };
            sink.lock().unwrap().push((blob.clone(), bytes.to_vec()));
            Ok(blob)
        });

        let listing = uploaded.clone();
        store.expect_list().returning(move |folder| {
            Ok(listing
                .lock()
                .unwrap()
                .iter()
                .filter(|(blob, _)| blob.key.starts_with(folder))
                .map(|(blob, _)| blob.clone())
                .collect())
        });

        store.expect_get().returning(move |key| {
            uploaded
                .lock()
                .unwrap()
                .iter()
                .find(|(blob, _)| blob.key == key)
                .map(|(_, bytes)| bytes.clone())
                .ok_or_else(|| anyhow::anyhow!("no such key: {}", key))
        });

        store
    }

    fn failing_blob_store() -> MockRemoteBlobStore {
        let mut store = MockRemoteBlobStore::new();
        store
            .expect_put_raw()
            .returning(|_, _, _| Err(anyhow::anyhow!("remote unreachable")));
        store
            .expect_list()
            .returning(|_| Err(anyhow::anyhow!("remote unreachable")));
        store
    }

    #[tokio::test]
    async fn test_flat_object_lands_in_row_bucket() {
        let root = tempfile::tempdir().unwrap();
        let router = local_router(&root);

        let outcome = router.store(FLAT, "people.json").await.unwrap();

        assert!(outcome.success);
        assert!(!outcome.duplicate);
        assert_eq!(outcome.bucket, Bucket::RowOriented);
        assert_eq!(outcome.analysis.column_names(), ["id", "name"]);
        assert!(outcome.stored_name.starts_with("people_"));
        assert!(outcome
            .stored_name
            .ends_with(&format!("_{}.json", outcome.fingerprint.short())));
        assert!(outcome.remote_location.is_none());

        let local = outcome.local_location.clone().unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), FLAT);

        let schema = root
            .path()
            .join("schemas")
            .join(format!("{}.schema.json", local.file_stem().unwrap().to_str().unwrap()));
        assert!(schema.exists());
    }

    #[tokio::test]
    async fn test_nested_object_lands_in_document_bucket() {
        let root = tempfile::tempdir().unwrap();
        let router = local_router(&root);

        let outcome = router.store(NESTED, "profile.json").await.unwrap();

        assert_eq!(outcome.bucket, Bucket::DocumentOriented);
        assert_eq!(outcome.analysis.nesting_depth(), Some(1));
        assert_eq!(file_names(&root.path().join("row-oriented")).len(), 0);
        assert_eq!(file_names(&root.path().join("document-oriented")).len(), 2);
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let router = local_router(&root);
        let row_dir = root.path().join("row-oriented");

        let first = router.store(FLAT, "people.json").await.unwrap();
        let after_first = file_names(&row_dir);
        let schemas_after_first = file_names(&root.path().join("schemas"));

        let second = router.store(FLAT, "renamed.json").await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.stored_name, first.stored_name);
        assert_eq!(second.local_location, first.local_location);
        assert_eq!(second.fingerprint, first.fingerprint);
        assert_eq!(second.original_name, "renamed.json");

        assert_eq!(file_names(&row_dir), after_first);
        assert_eq!(file_names(&root.path().join("schemas")), schemas_after_first);

        let data_files = after_first.iter().filter(|n| !n.ends_with(".meta.json")).count();
        let sidecars = after_first.iter().filter(|n| n.ends_with(".meta.json")).count();
        assert_eq!(data_files, 1);
        assert_eq!(sidecars, 1);
    }

    #[tokio::test]
    async fn test_sidecar_reproduces_analysis() {
        let root = tempfile::tempdir().unwrap();
        let router = local_router(&root);

        let outcome = router.store(NESTED, "profile.json").await.unwrap();
        let sidecar = read_sidecar(outcome.local_location.as_ref().unwrap())
            .await
            .unwrap();

        assert_eq!(sidecar.analysis, outcome.analysis);
        assert_eq!(sidecar.fingerprint, outcome.fingerprint);
        assert_eq!(sidecar.file_size, NESTED.len() as u64);
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected_without_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let router = local_router(&root);

        let err = router.store(b"{not json", "broken.json").await.unwrap_err();

        assert!(matches!(err, StorageError::InvalidInput(_)));
        assert!(file_names(&root.path().join("temp")).is_empty());
        assert!(file_names(&root.path().join("row-oriented")).is_empty());
        assert!(file_names(&root.path().join("document-oriented")).is_empty());
    }

    #[tokio::test]
    async fn test_staging_area_is_empty_after_every_store() {
        let root = tempfile::tempdir().unwrap();
        let router = local_router(&root);

        router.store(FLAT, "a.json").await.unwrap();
        router.store(FLAT, "a.json").await.unwrap();
        router.store(b"[]", "empty.json").await.unwrap();

        assert!(file_names(&root.path().join("temp")).is_empty());
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let router = StorageRouter::builder(StorageMode::LocalOnly, LocalStore::under(root.path()))
            .max_upload_bytes(8)
            .build()
            .unwrap();

        let err = router.store(FLAT, "people.json").await.unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { limit: 8, .. }));
    }

    #[tokio::test]
    async fn test_dual_mode_remote_failure_degrades() {
        let root = tempfile::tempdir().unwrap();
        let router = StorageRouter::builder(StorageMode::Both, LocalStore::under(root.path()))
            .blob_store(Arc::new(failing_blob_store()))
            .build()
            .unwrap();

        let outcome = router.store(FLAT, "people.json").await.unwrap();

        assert!(outcome.success);
        assert!(outcome.remote_location.is_none());
        let degraded = outcome.degraded.clone().expect("degraded indicator");
        assert_eq!(degraded.leg, Leg::Remote);
        assert!(degraded.error.contains("remote unreachable"));
        assert!(outcome.local_location.as_ref().unwrap().exists());

        let serialized = serde_json::to_value(&outcome).unwrap();
        assert!(serialized["remote_location"].is_null());
        assert_eq!(serialized["degraded"]["leg"], "remote");
    }

    #[tokio::test]
    async fn test_dual_mode_records_remote_location() {
        let root = tempfile::tempdir().unwrap();
        let router = StorageRouter::builder(StorageMode::Both, LocalStore::under(root.path()))
            .blob_store(Arc::new(recording_blob_store()))
            .build()
            .unwrap();

        let outcome = router.store(FLAT, "people.json").await.unwrap();

        let expected = format!("s3://test/json/row-oriented/{}", outcome.stored_name);
        assert_eq!(outcome.remote_location.as_deref(), Some(expected.as_str()));
        assert!(outcome.degraded.is_none());

        let sidecar = read_sidecar(outcome.local_location.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(sidecar.remote_location, Some(expected));
    }

    #[tokio::test]
    async fn test_remote_only_failure_is_hard_error() {
        let root = tempfile::tempdir().unwrap();
        let mut store = MockRemoteBlobStore::new();
        store.expect_list().returning(|_| Ok(Vec::new()));
        store
            .expect_put_raw()
            .returning(|_, _, _| Err(anyhow::anyhow!("bucket rejected write")));

        let router = StorageRouter::builder(StorageMode::RemoteOnly, LocalStore::under(root.path()))
            .blob_store(Arc::new(store))
            .build()
            .unwrap();

        let err = router.store(FLAT, "people.json").await.unwrap_err();

        assert!(matches!(err, StorageError::Persistence(ref msg) if msg.contains("bucket rejected write")));
        assert!(err.is_retryable());
        assert!(file_names(&root.path().join("temp")).is_empty());
        assert!(file_names(&root.path().join("row-oriented")).is_empty());
    }

    #[tokio::test]
    async fn test_remote_only_deduplicates_by_listing() {
        let root = tempfile::tempdir().unwrap();
        let router = StorageRouter::builder(StorageMode::RemoteOnly, LocalStore::under(root.path()))
            .blob_store(Arc::new(recording_blob_store()))
            .build()
            .unwrap();

        let first = router.store(NESTED, "profile.json").await.unwrap();
        let second = router.store(NESTED, "profile.json").await.unwrap();

        assert!(first.local_location.is_none());
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.remote_location, first.remote_location);
        assert!(file_names(&root.path().join("document-oriented")).is_empty());
    }

    #[tokio::test]
    async fn test_document_store_receives_record() {
        let root = tempfile::tempdir().unwrap();
        let expected_id = Fingerprint::of(FLAT).to_string();

        let mut documents = MockRemoteDocumentStore::new();
        documents
            .expect_upsert()
            .withf(move |collection, id, document| {
                collection == "row-oriented"
                    && id == expected_id
                    && document["content"]["name"] == "Ann"
                    && document["analysis"]["recommendation"] == "row-oriented"
            })
            .times(1)
            .returning(|_, _, _| Ok(UpsertOutcome::Inserted));

        let router = StorageRouter::builder(StorageMode::LocalOnly, LocalStore::under(root.path()))
            .document_store(Arc::new(documents))
            .build()
            .unwrap();

        router.store(FLAT, "people.json").await.unwrap();
        // Second store is a duplicate and must not upsert again.
        router.store(FLAT, "people.json").await.unwrap();
    }

    #[tokio::test]
    async fn test_document_store_failure_does_not_fail_store() {
        let root = tempfile::tempdir().unwrap();
        let mut documents = MockRemoteDocumentStore::new();
        documents
            .expect_upsert()
            .returning(|_, _, _| Err(anyhow::anyhow!("database down")));

        let router = StorageRouter::builder(StorageMode::LocalOnly, LocalStore::under(root.path()))
            .document_store(Arc::new(documents))
            .build()
            .unwrap();

        let outcome = tokio_test::assert_ok!(router.store(FLAT, "people.json").await);
        assert!(!outcome.duplicate);
    }

    #[tokio::test]
    async fn test_sidecarless_prefix_collision_is_stored() {
        let root = tempfile::tempdir().unwrap();
        let router = local_router(&root);
        let row_dir = root.path().join("row-oriented");
        let fp = Fingerprint::of(FLAT);

        let impostor = format!("other_20240101_000000_{}.json", fp.short());
        std::fs::create_dir_all(&row_dir).unwrap();
        std::fs::write(row_dir.join(&impostor), br#"{"id":999,"name":"Zed"}"#).unwrap();

        let outcome = router.store(FLAT, "people.json").await.unwrap();

        assert!(!outcome.duplicate);
        assert_ne!(outcome.stored_name, impostor);
        assert_eq!(std::fs::read(outcome.local_location.unwrap()).unwrap(), FLAT);
    }

    #[tokio::test]
    async fn test_sidecar_failure_does_not_fail_store() {
        let root = tempfile::tempdir().unwrap();
        // A regular file where the schema directory should be.
        std::fs::write(root.path().join("schemas"), b"not a directory").unwrap();
        let router = local_router(&root);

        let outcome = tokio_test::assert_ok!(router.store(FLAT, "people.json").await);

        let local = outcome.local_location.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), FLAT);
        assert!(root.path().join("schemas").is_file());
        assert!(file_names(&root.path().join("temp")).is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_analysis_does_not_stall_other_tasks() {
        let root = tempfile::tempdir().unwrap();
        let router = local_router(&root);

        let rows: Vec<Value> = (0..100_000)
            .map(|i| json!({"id": i, "name": format!("user-{}", i), "score": i * 3}))
            .collect();
        let payload = serde_json::to_vec(&rows).unwrap();

        let max_gap = Arc::new(Mutex::new(Duration::ZERO));
        let ticker = {
            let max_gap = max_gap.clone();
            tokio::spawn(async move {
                let mut last = Instant::now();
                loop {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    let now = Instant::now();
                    let mut gap = max_gap.lock().unwrap();
                    *gap = (*gap).max(now - last);
                    last = now;
                }
            })
        };
        tokio::task::yield_now().await;

        let outcome = router.store(&payload, "rows.json").await.unwrap();
        ticker.abort();

        assert_eq!(outcome.bucket, Bucket::RowOriented);
        let gap = *max_gap.lock().unwrap();
        assert!(gap < Duration::from_millis(500), "ticker stalled for {:?}", gap);
    }

    #[tokio::test]
    async fn test_stats_and_staging_sweep() {
        let root = tempfile::tempdir().unwrap();
        let router = StorageRouter::builder(StorageMode::LocalOnly, LocalStore::under(root.path()))
            .staging_max_age(Duration::ZERO)
            .build()
            .unwrap();

        router.store(FLAT, "people.json").await.unwrap();
        router.store(NESTED, "profile.json").await.unwrap();

        let stats = router.stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|b| b.file_count == 1));
        let row = stats.iter().find(|b| b.bucket == Bucket::RowOriented).unwrap();
        assert_eq!(row.total_bytes, FLAT.len() as u64);

        std::fs::write(root.path().join("temp").join("crashed_upload.json"), b"{}").unwrap();
        assert_eq!(router.sweep_staging().await.unwrap(), 1);
        assert!(file_names(&root.path().join("temp")).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_distinct_uploads() {
        let root = tempfile::tempdir().unwrap();
        let router = Arc::new(local_router(&root));

        let (a, b) = tokio::join!(
            router.store(FLAT, "a.json"),
            router.store(NESTED, "b.json")
        );

        assert_eq!(a.unwrap().bucket, Bucket::RowOriented);
        assert_eq!(b.unwrap().bucket, Bucket::DocumentOriented);
        assert!(file_names(&root.path().join("temp")).is_empty());
    }

    #[test]
    fn test_remote_mode_without_blob_store_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        for mode in [StorageMode::RemoteOnly, StorageMode::Both] {
            let result = StorageRouter::builder(mode, LocalStore::under(root.path())).build();
            assert!(matches!(result, Err(StorageError::Configuration(_))));
        }
    }

    #[test]
    fn test_resolve_legs() {
        let both_failed = resolve_legs(Some(Err("disk".into())), Some(Err("net".into())));
        assert!(matches!(both_failed, Err(StorageError::Persistence(_))));

        let (local, remote, degraded) =
            resolve_legs(Some(Err("disk full".into())), Some(Ok("s3://b/k".into()))).unwrap();
        assert!(local.is_none());
        assert_eq!(remote.as_deref(), Some("s3://b/k"));
        assert_eq!(degraded.unwrap().leg, Leg::Local);
    }
}
