use anyhow::{Context, Result};
use router_service::api::{start_api_server, AppState};
use router_service::remote::{RemoteBlobStore, RemoteDocumentStore};
use router_service::{Config, LocalStore, PgDocumentStore, S3BlobStore, StorageRouter};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        mode = %config.storage.mode,
        "Starting router service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let local = LocalStore::new(&config.storage);
    local
        .ensure_dirs()
        .await
        .context("Failed to create storage directories")?;

    // Nothing is in flight yet, so every staged file is left over from a previous run.
    local
        .sweep_temp(Duration::ZERO)
        .await
        .context("Failed to sweep staging directory")?;

    let blob_store: Option<Arc<dyn RemoteBlobStore>> = match &config.s3 {
        Some(s3) => {
            let store = S3BlobStore::new(s3)
                .await
                .context("Failed to initialize S3 blob store")?;
            Some(Arc::new(store) as Arc<dyn RemoteBlobStore>)
        }
        None => None,
    };

    let document_store: Option<Arc<dyn RemoteDocumentStore>> = match &config.database {
        Some(database) => {
            let store = PgDocumentStore::new(database)
                .await
                .context("Failed to initialize document store")?;

            // Run migrations if enabled
            if database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Some(Arc::new(store) as Arc<dyn RemoteDocumentStore>)
        }
        None => None,
    };

    let router = Arc::new(
        StorageRouter::from_config(&config, blob_store, document_store)
            .context("Failed to build storage router")?,
    );

    let api_state = AppState {
        router,
        service_name: config.service.name.clone(),
        upload_concurrency: config.api.upload_concurrency,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Router service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down router service");

    api_handle.abort();

    info!("Router service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
