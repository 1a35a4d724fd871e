//! Router Service
//!
//! JSON content classification and storage routing. Every uploaded document is
//! analysed for shape, assigned to a row-oriented or document-oriented bucket,
//! fingerprinted for de-duplication, and persisted locally, remotely, or both.
//!
//! ## Features
//!
//! - **Shape Classification**: Uniform arrays of flat records go to the
//!   row-oriented bucket; nested or heterogeneous content goes to the
//!   document-oriented bucket
//! - **Content De-duplication**: Identical bytes already stored in a bucket are
//!   reported instead of written again
//! - **Pluggable Persistence**: Local directories, S3, or both, with the
//!   remote leg degrading gracefully when the local copy succeeded
//! - **Sidecar Metadata**: Analysis and schema records written next to each
//!   stored file
//!
//! ## Architecture
//!
//! ```text
//! HTTP Intake                                    Local Buckets
//! ┌──────────────┐                              ┌──────────────────┐
//! │ /upload      │                              │ row-oriented/    │
//! │ /bulk-upload │                              │ document-oriented│
//! └──────────────┘                              │ schemas/         │
//!        │                                      └──────────────────┘
//!        ▼                                             ▲
//! ┌──────────────┐    ┌──────────────┐                 │
//! │ Storage      │───▶│ Classifier   │                 │
//! │ Router       │    └──────────────┘                 │
//! │              │    ┌──────────────┐                 │
//! │              │───▶│ Duplicate    │                 │
//! │              │    │ Detector     │                 │
//! │              │    └──────────────┘                 │
//! │              │─────────────────────────────────────┤
//! │              │                                     │
//! │              │    ┌──────────────┐          ┌──────────────┐
//! │              │───▶│ S3 Blob      │          │ Metadata     │
//! │              │    │ Store        │          │ Writer       │
//! └──────────────┘    └──────────────┘          └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │ PostgreSQL   │
//! │ Documents    │
//! └──────────────┘
//! ```

pub mod api;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod document_store;
pub mod error;
pub mod fingerprint;
pub mod local_store;
pub mod metadata_writer;
pub mod remote;
pub mod s3_store;
pub mod storage_router;

pub use api::AppState;
pub use classifier::{AnalysisResult, Bucket, Classifier, ClassifierBuilder, Structure};
pub use config::{Config, StorageMode};
pub use dedup::{DuplicateDetector, StoredRecord};
pub use document_store::PgDocumentStore;
pub use error::StorageError;
pub use fingerprint::Fingerprint;
pub use local_store::{BucketStats, LocalStore};
pub use metadata_writer::{MetadataWriter, SchemaRecord, SidecarMetadata};
pub use remote::{BlobLocation, RemoteBlobStore, RemoteDocumentStore, UpsertOutcome};
pub use s3_store::S3BlobStore;
pub use storage_router::{StorageRouter, StorageRouterBuilder, StoreOutcome};
