use crate::config::DatabaseConfig;
use crate::remote::{RemoteDocumentStore, UpsertOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

/// Document store over a PostgreSQL JSONB table
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    /// Create a new document store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RemoteDocumentStore for PgDocumentStore {
    #[instrument(skip(self, document))]
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &serde_json::Value,
    ) -> Result<UpsertOutcome> {
        // xmax is zero only for a freshly inserted tuple
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO documents (collection, id, document, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (collection, id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(document)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert document")?;

        let outcome = if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Replaced
        };

        debug!(collection = %collection, id = %id, outcome = ?outcome, "Document upserted");
        metrics::counter!("router.documents.upserted").increment(1);

        Ok(outcome)
    }
}
