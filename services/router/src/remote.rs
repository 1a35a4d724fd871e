//! Capability interfaces for remote persistence.
//!
//! The router only needs "put bytes under a key" and "upsert a document by
//! id"; concrete clients are built at process start and injected.

use crate::classifier::Bucket;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

/// Where a blob landed in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobLocation {
    /// Object key, folder included
    pub key: String,
    /// URL or URI callers can resolve
    pub location: String,
}

/// Remote blob storage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteBlobStore: Send + Sync {
    /// Store media bytes; content type follows the key's extension
    async fn put(&self, bytes: &[u8], key: &str, folder: &str) -> Result<BlobLocation>;

    /// Store bytes verbatim as a JSON object
    async fn put_raw(&self, bytes: &[u8], key: &str, folder: &str) -> Result<BlobLocation>;

    /// List every blob under a folder
    async fn list(&self, folder: &str) -> Result<Vec<BlobLocation>>;

    /// Fetch a blob's bytes by its full object key
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Result of an idempotent upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Remote document storage keyed by id
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    /// Insert the document if absent, replace it otherwise
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &serde_json::Value,
    ) -> Result<UpsertOutcome>;
}

/// Join a folder and key the way every blob store lays out objects
pub fn object_key(folder: &str, key: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", folder, key)
    }
}

/// Remote folder holding a bucket's objects
pub fn bucket_folder(root: &str, bucket: Bucket) -> String {
    object_key(root, bucket.as_str())
}
