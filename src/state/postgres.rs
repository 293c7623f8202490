//! Postgres-backed state store
//!
//! Audit entries and checkpoints are stored as JSON text; the schema is
//! created lazily on first use.

use super::{Checkpoint, StateStore};
use crate::audit::AuditEntry;
use crate::error::OrchestrationError;
use crate::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::env;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

pub struct PostgresStateStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresStateStore {
    /// Lazily connecting pool; no I/O until the first query.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;

        info!("State store backend: postgres");

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    /// `POSTGRES_URL` or `DATABASE_URL`, if either is set.
    pub fn from_env() -> Option<Result<Self>> {
        let url = env::var("POSTGRES_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()?;
        Some(Self::connect_lazy(&url))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;

        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS audit_entries (
                      seq BIGINT PRIMARY KEY,
                      recorded_at TIMESTAMPTZ NOT NULL,
                      kind TEXT NOT NULL,
                      entry_hash TEXT NOT NULL,
                      payload TEXT NOT NULL
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS checkpoints (
                      anchor_seq BIGINT PRIMARY KEY,
                      taken_at TIMESTAMPTZ NOT NULL,
                      payload TEXT NOT NULL
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize state store schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for PostgresStateStore {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.ensure_schema().await?;
        let payload = serde_json::to_string(entry)?;

        sqlx::query(
            r#"
            INSERT INTO audit_entries (seq, recorded_at, kind, entry_hash, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.seq as i64)
        .bind(entry.recorded_at)
        .bind(entry.event.kind())
        .bind(entry.entry_hash.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_audit_since(&self, after: u64) -> Result<Vec<AuditEntry>> {
        self.ensure_schema().await?;

        let rows = sqlx::query("SELECT payload FROM audit_entries WHERE seq > $1 ORDER BY seq ASC")
            .bind(after as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<AuditEntry> {
                let payload: String = row.try_get("payload")?;
                Ok(serde_json::from_str::<AuditEntry>(&payload)?)
            })
            .collect()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.ensure_schema().await?;
        let payload = serde_json::to_string(checkpoint)?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (anchor_seq, taken_at, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (anchor_seq) DO UPDATE SET taken_at = EXCLUDED.taken_at, payload = EXCLUDED.payload
            "#,
        )
        .bind(checkpoint.anchor.seq as i64)
        .bind(checkpoint.taken_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT payload FROM checkpoints ORDER BY anchor_seq DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}
