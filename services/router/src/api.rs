use crate::config::ApiConfig;
use crate::error::StorageError;
use crate::local_store::BucketStats;
use crate::storage_router::{StorageRouter, StoreOutcome};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Room for multipart boundaries and headers on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;
/// Bulk requests may carry this many maximum-size files
const BULK_FILE_FACTOR: usize = 10;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<StorageRouter>,
    pub service_name: String,
    pub upload_concurrency: usize,
}

/// Single upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub details: StoreOutcome,
}

/// Bulk upload response
#[derive(Debug, Serialize)]
pub struct BulkUploadResponse {
    pub message: String,
    pub summary: BulkSummary,
    pub successful_files: Vec<StoreOutcome>,
    pub failed_files: Vec<FailedFile>,
}

#[derive(Debug, Serialize)]
pub struct BulkSummary {
    pub total_files: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// A file in a bulk request that could not be stored
#[derive(Debug, Serialize)]
pub struct FailedFile {
    pub filename: String,
    pub error: String,
    pub code: String,
    /// Resubmitting this file alone may succeed
    pub retryable: bool,
}

/// Local bucket statistics
#[derive(Debug, Serialize)]
pub struct StorageStatsResponse {
    pub storage_mode: String,
    pub buckets: Vec<BucketStats>,
    pub total_files: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub message: String,
    pub deleted_temp_files: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let single_limit = state
        .router
        .max_upload_bytes()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let bulk_limit = single_limit.saturating_mul(BULK_FILE_FACTOR);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/v1/json/upload",
            post(upload_json).layer(DefaultBodyLimit::max(single_limit)),
        )
        .route(
            "/api/v1/json/bulk-upload",
            post(bulk_upload_json).layer(DefaultBodyLimit::max(bulk_limit)),
        )
        .route("/api/v1/storage/stats", get(storage_stats))
        .route("/api/v1/storage/cleanup", post(cleanup_staging))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
        "storage_mode": state.router.mode().as_str(),
    }))
}

/// Store one JSON file sent as multipart field `file`
#[instrument(skip(state, multipart))]
async fn upload_json(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if !is_json_filename(&filename) {
            return Err(bad_request("Only JSON files are allowed", "UNSUPPORTED_TYPE"));
        }

        let bytes = field.bytes().await.map_err(multipart_error)?;
        debug!(filename = %filename, size_bytes = bytes.len(), "Received upload");

        let outcome = state
            .router
            .store(&bytes, &filename)
            .await
            .map_err(|e| error_response(&e))?;

        let message = if outcome.duplicate {
            "File already exists (duplicate detected)"
        } else {
            "JSON processed successfully"
        };

        return Ok(Json(UploadResponse {
            message: message.to_string(),
            details: outcome,
        }));
    }

    Err(bad_request("Missing multipart field `file`", "MISSING_FILE"))
}

/// Store every JSON file of a multipart request concurrently
#[instrument(skip(state, multipart))]
async fn bulk_upload_json(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<BulkUploadResponse>, ApiError> {
    let mut files: Vec<(String, Bytes)> = Vec::new();
    let mut skipped = 0;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let filename = field.file_name().unwrap_or_default().to_string();
        if !is_json_filename(&filename) {
            skipped += 1;
            continue;
        }
        let bytes = field.bytes().await.map_err(multipart_error)?;
        files.push((filename, bytes));
    }

    let total_files = files.len() + skipped;
    let router = state.router.clone();

    let results: Vec<(String, Result<StoreOutcome, StorageError>)> = stream::iter(files)
        .map(move |(filename, bytes)| {
            let router = router.clone();
            async move {
                let result = router.store(&bytes, &filename).await;
                (filename, result)
            }
        })
        .buffer_unordered(state.upload_concurrency.max(1))
        .collect()
        .await;

    let mut successful_files = Vec::new();
    let mut failed_files = Vec::new();
    for (filename, result) in results {
        match result {
            Ok(outcome) => successful_files.push(outcome),
            Err(e) => {
                warn!(filename = %filename, error = %e, "Bulk file failed");
                failed_files.push(FailedFile {
                    filename,
                    error: e.to_string(),
                    code: e.code().to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }

    Ok(Json(BulkUploadResponse {
        message: "Bulk processing completed".to_string(),
        summary: BulkSummary {
            total_files,
            successful: successful_files.len(),
            failed: failed_files.len(),
            skipped,
        },
        successful_files,
        failed_files,
    }))
}

/// File count and bytes per local bucket
async fn storage_stats(
    State(state): State<AppState>,
) -> Result<Json<StorageStatsResponse>, ApiError> {
    let buckets = state.router.stats().await.map_err(|e| error_response(&e))?;

    Ok(Json(StorageStatsResponse {
        storage_mode: state.router.mode().as_str().to_string(),
        total_files: buckets.iter().map(|b| b.file_count).sum(),
        total_bytes: buckets.iter().map(|b| b.total_bytes).sum(),
        buckets,
    }))
}

/// Remove abandoned staged uploads
async fn cleanup_staging(
    State(state): State<AppState>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let deleted = state
        .router
        .sweep_staging()
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(CleanupResponse {
        message: "Cleanup completed".to_string(),
        deleted_temp_files: deleted,
    }))
}

fn is_json_filename(filename: &str) -> bool {
    filename.to_lowercase().ends_with(".json")
}

/// Map a store failure onto an HTTP status and body
fn error_response(err: &StorageError) -> ApiError {
    let status = match err {
        StorageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        StorageError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        StorageError::Persistence(_) => StatusCode::BAD_GATEWAY,
        StorageError::Configuration(_) | StorageError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    let error = match err {
        StorageError::Internal(_) => "Internal server error".to_string(),
        other => other.to_string(),
    };

    (
        status,
        Json(ErrorResponse {
            error,
            code: err.code().to_string(),
        }),
    )
}

fn multipart_error(err: MultipartError) -> ApiError {
    (
        err.status(),
        Json(ErrorResponse {
            error: err.body_text(),
            code: "BAD_MULTIPART".to_string(),
        }),
    )
}

fn bad_request(message: &str, code: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Start the intake API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting intake API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
