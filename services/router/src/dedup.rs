use crate::classifier::Bucket;
use crate::error::StorageError;
use crate::fingerprint::Fingerprint;
use crate::local_store::{is_sidecar, stored_stem, LocalStore};
use crate::metadata_writer::read_sidecar;
use crate::remote::{bucket_folder, BlobLocation, RemoteBlobStore};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A document already persisted for some fingerprint and bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub bucket: Bucket,
    pub stored_name: String,
    pub local_location: Option<PathBuf>,
    pub remote_location: Option<String>,
    pub fingerprint: Fingerprint,
    pub stored_at: DateTime<Utc>,
}

/// Where existing records are looked up
enum Source {
    Local(LocalStore),
    Remote {
        store: Arc<dyn RemoteBlobStore>,
        root: String,
    },
}

/// Finds an existing record whose stored name embeds a fingerprint.
///
/// A name match is only a candidate; the full digest is confirmed from the
/// sidecar or the stored bytes. Lookups are scoped to one bucket and never
/// write.
pub struct DuplicateDetector {
    source: Source,
}

impl DuplicateDetector {
    /// Scan local bucket directories
    pub fn local(store: LocalStore) -> Self {
        Self {
            source: Source::Local(store),
        }
    }

    /// List bucket folders in a remote blob store
    pub fn remote(store: Arc<dyn RemoteBlobStore>, root: impl Into<String>) -> Self {
        Self {
            source: Source::Remote {
                store,
                root: root.into(),
            },
        }
    }

    #[instrument(skip(self), fields(fingerprint = %fingerprint.short()))]
    pub async fn find_duplicate(
        &self,
        fingerprint: &Fingerprint,
        bucket: Bucket,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let found = match &self.source {
            Source::Local(store) => scan_local(store, fingerprint, bucket).await?,
            Source::Remote { store, root } => {
                scan_remote(store.as_ref(), root, fingerprint, bucket).await?
            }
        };

        if let Some(ref record) = found {
            debug!(stored_name = %record.stored_name, bucket = %bucket, "Duplicate found");
        }

        Ok(found)
    }
}

async fn scan_local(
    store: &LocalStore,
    fingerprint: &Fingerprint,
    bucket: Bucket,
) -> Result<Option<StoredRecord>, StorageError> {
    let dir = store.bucket_dir(bucket);
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !is_sidecar(&name) && embeds_fingerprint(&name, fingerprint) {
            candidates.push(name);
        }
    }
    candidates.sort();

    for name in candidates {
        let path = dir.join(&name);
        let (stored_at, remote_location) = match read_sidecar(&path).await {
            // The name only carries a prefix; the sidecar has the full digest.
            Ok(sidecar) if &sidecar.fingerprint == fingerprint => {
                (sidecar.analyzed_at, sidecar.remote_location)
            }
            Ok(_) => continue,
            Err(_) => {
                // Sidecars are best-effort, so fall back to hashing the data file.
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if !digest_matches(bytes, fingerprint).await? {
                    continue;
                }
                (parse_stored_at(&name).unwrap_or_else(Utc::now), None)
            }
        };

        return Ok(Some(StoredRecord {
            bucket,
            stored_at,
            remote_location,
            local_location: Some(path),
            fingerprint: fingerprint.clone(),
            stored_name: name,
        }));
    }

    Ok(None)
}

async fn scan_remote(
    store: &dyn RemoteBlobStore,
    root: &str,
    fingerprint: &Fingerprint,
    bucket: Bucket,
) -> Result<Option<StoredRecord>, StorageError> {
    let blobs = store
        .list(&bucket_folder(root, bucket))
        .await
        .map_err(|e| StorageError::Persistence(format!("{:#}", e)))?;

    let mut candidates: Vec<BlobLocation> = blobs
        .into_iter()
        .filter(|blob| embeds_fingerprint(object_name(&blob.key), fingerprint))
        .collect();
    candidates.sort_by(|a, b| a.key.cmp(&b.key));

    for blob in candidates {
        let bytes = store
            .get(&blob.key)
            .await
            .map_err(|e| StorageError::Persistence(format!("{:#}", e)))?;
        if !digest_matches(bytes, fingerprint).await? {
            continue;
        }

        let name = object_name(&blob.key).to_string();
        return Ok(Some(StoredRecord {
            bucket,
            stored_at: parse_stored_at(&name).unwrap_or_else(Utc::now),
            local_location: None,
            remote_location: Some(blob.location),
            fingerprint: fingerprint.clone(),
            stored_name: name,
        }));
    }

    Ok(None)
}

/// Hash candidate bytes on the blocking pool and compare full digests
async fn digest_matches(bytes: Vec<u8>, fingerprint: &Fingerprint) -> Result<bool, StorageError> {
    let digest = tokio::task::spawn_blocking(move || Fingerprint::of(&bytes))
        .await
        .map_err(|e| StorageError::Internal(format!("hash task failed: {}", e)))?;
    Ok(&digest == fingerprint)
}

fn object_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Stored names end their stem with `_{hash8}`
fn embeds_fingerprint(stored_name: &str, fingerprint: &Fingerprint) -> bool {
    stored_stem(stored_name)
        .rsplit_once('_')
        .map(|(_, hash)| hash == fingerprint.short())
        .unwrap_or(false)
}

/// Recover the timestamp embedded in `{stem}_{YYYYmmdd}_{HHMMSS}_{hash8}`
fn parse_stored_at(stored_name: &str) -> Option<DateTime<Utc>> {
    let mut parts = stored_stem(stored_name).rsplitn(4, '_');
    let _hash = parts.next()?;
    let time = parts.next()?;
    let date = parts.next()?;
    NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), "%Y%m%d_%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteBlobStore;
    use chrono::TimeZone;

    #[test]
    fn test_embeds_fingerprint() {
        let fp = Fingerprint::of(b"");
        assert!(embeds_fingerprint("a_20240115_103045_e3b0c442.json", &fp));
        assert!(embeds_fingerprint("a_b_20240115_103045_e3b0c442", &fp));
        assert!(!embeds_fingerprint("a_20240115_103045_deadbeef.json", &fp));
        assert!(!embeds_fingerprint("e3b0c442.json", &fp));
    }

    #[test]
    fn test_parse_stored_at() {
        assert_eq!(
            parse_stored_at("my_file_20240115_103045_e3b0c442.json"),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap())
        );
        assert_eq!(parse_stored_at("garbage.json"), None);
    }

    #[tokio::test]
    async fn test_missing_bucket_dir_has_no_duplicates() {
        let root = tempfile::tempdir().unwrap();
        let detector = DuplicateDetector::local(LocalStore::under(&root.path().join("absent")));

        let found = detector
            .find_duplicate(&Fingerprint::of(b"{}"), Bucket::RowOriented)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_local_scan_is_scoped_to_bucket() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::under(root.path());
        let fp = Fingerprint::of(b"{}");
        let name = format!("doc_20240115_103045_{}.json", fp.short());

        let dir = store.bucket_dir(Bucket::RowOriented).to_path_buf();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(&name), b"{}").await.unwrap();

        let detector = DuplicateDetector::local(store);
        let found = detector
            .find_duplicate(&fp, Bucket::RowOriented)
            .await
            .unwrap()
            .expect("duplicate in row bucket");
        assert_eq!(found.stored_name, name);
        assert_eq!(found.local_location, Some(dir.join(&name)));
        assert_eq!(
            found.stored_at,
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap()
        );

        let other = detector
            .find_duplicate(&fp, Bucket::DocumentOriented)
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_prefix_collision_without_sidecar_is_not_duplicate() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::under(root.path());
        let content: &[u8] = br#"{"id":1,"name":"Ann"}"#;
        let fp = Fingerprint::of(content);

        // Same 8-hex suffix, different bytes, no sidecar to confirm against.
        let dir = store.bucket_dir(Bucket::RowOriented).to_path_buf();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join(format!("other_20240101_000000_{}.json", fp.short())),
            br#"{"id":999,"name":"Zed"}"#,
        )
        .await
        .unwrap();

        let found = DuplicateDetector::local(store)
            .find_duplicate(&fp, Bucket::RowOriented)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_sidecars_are_not_candidates() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::under(root.path());
        let fp = Fingerprint::of(b"[]");
        let dir = store.bucket_dir(Bucket::DocumentOriented).to_path_buf();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join(format!("doc_20240115_103045_{}.meta.json", fp.short())),
            b"{}",
        )
        .await
        .unwrap();

        let found = DuplicateDetector::local(store)
            .find_duplicate(&fp, Bucket::DocumentOriented)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_remote_listing() {
        let fp = Fingerprint::of(b"{}");
        let key = format!("json/row-oriented/doc_20240115_103045_{}.json", fp.short());
        let listed = vec![
            BlobLocation {
                key: "json/row-oriented/other_20240115_103045_00000000.json".to_string(),
                location: "s3://b/other".to_string(),
            },
            BlobLocation {
                key: key.clone(),
                location: format!("s3://b/{}", key),
            },
        ];

        let mut remote = MockRemoteBlobStore::new();
        remote
            .expect_list()
            .withf(|folder| folder == "json/row-oriented")
            .returning(move |_| Ok(listed.clone()));
        let expected_key = key.clone();
        remote
            .expect_get()
            .withf(move |k| k == expected_key)
            .times(1)
            .returning(|_| Ok(b"{}".to_vec()));

        let detector = DuplicateDetector::remote(Arc::new(remote), "json");
        let found = detector
            .find_duplicate(&fp, Bucket::RowOriented)
            .await
            .unwrap()
            .expect("duplicate listed remotely");

        assert_eq!(found.remote_location, Some(format!("s3://b/{}", key)));
        assert!(found.local_location.is_none());
    }

    #[tokio::test]
    async fn test_remote_prefix_collision_is_not_duplicate() {
        let fp = Fingerprint::of(b"{}");
        let key = format!("json/row-oriented/doc_20240115_103045_{}.json", fp.short());
        let listed = vec![BlobLocation {
            key: key.clone(),
            location: format!("s3://b/{}", key),
        }];

        let mut remote = MockRemoteBlobStore::new();
        remote
            .expect_list()
            .returning(move |_| Ok(listed.clone()));
        remote
            .expect_get()
            .returning(|_| Ok(br#"{"id":999}"#.to_vec()));

        let found = DuplicateDetector::remote(Arc::new(remote), "json")
            .find_duplicate(&fp, Bucket::RowOriented)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_remote_listing_failure_is_persistence_error() {
        let mut remote = MockRemoteBlobStore::new();
        remote
            .expect_list()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));

        let detector = DuplicateDetector::remote(Arc::new(remote), "json");
        let err = detector
            .find_duplicate(&Fingerprint::of(b"{}"), Bucket::RowOriented)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Persistence(_)));
    }
}
