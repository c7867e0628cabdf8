//! Database-backed history store.
//!
//! Stores run records in PostgreSQL tables within the `_legacy_migrate`
//! schema of the target database. Preferred over the file store when
//! several service instances share one target:
//! - Transactional upserts
//! - The lease is a singleton row, so only one instance can hold it
//! - No file system access required

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tracing::debug;

use super::backend::{run_status_to_str, HistoryStore, Lease};
use super::MigrationRun;
use crate::error::{MigrateError, Result};

/// PostgreSQL history store.
pub struct PgHistoryStore {
    pool: Pool,
    schema: String,
}

impl PgHistoryStore {
    /// Create a history store on an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            schema: "_legacy_migrate".to_string(),
        }
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "history store"))
    }

    fn decode(payload: &str) -> Result<MigrationRun> {
        serde_json::from_str(payload)
            .map_err(|e| MigrateError::History(format!("corrupt run record: {}", e)))
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn init(&self) -> Result<()> {
        let conn = self.conn().await?;

        conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema), &[])
            .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.migration_runs (
                    migration_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL CHECK (status IN
                        ('not_started', 'in_progress', 'paused', 'completed', 'failed', 'cancelled')),
                    start_time TIMESTAMPTZ NOT NULL,
                    end_time TIMESTAMPTZ,
                    payload TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_migration_runs_latest
                    ON {}.migration_runs(start_time DESC)",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.active_lease (
                    singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
                    migration_id TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    acquired_at TIMESTAMPTZ NOT NULL,
                    renewed_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "ALTER TABLE {}.active_lease
                    ADD COLUMN IF NOT EXISTS renewed_at TIMESTAMPTZ NOT NULL DEFAULT now()",
                self.schema
            ),
            &[],
        )
        .await?;

        debug!("History schema {} ready", self.schema);
        Ok(())
    }

    async fn save(&self, run: &MigrationRun) -> Result<()> {
        let payload = serde_json::to_string(run)?;
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!(
                "INSERT INTO {}.migration_runs (migration_id, status, start_time, end_time, payload)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (migration_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    end_time = EXCLUDED.end_time,
                    payload = EXCLUDED.payload,
                    updated_at = NOW()",
                self.schema
            ),
            &[
                &run.migration_id,
                &run_status_to_str(run.status),
                &run.start_time,
                &run.end_time,
                &payload,
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, migration_id: &str) -> Result<Option<MigrationRun>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT payload FROM {}.migration_runs WHERE migration_id = $1",
                    self.schema
                ),
                &[&migration_id],
            )
            .await?;

        match row {
            Some(r) => {
                let payload: String = r.get(0);
                Self::decode(&payload).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<MigrationRun>> {
        let conn = self.conn().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = conn
            .query(
                &format!(
                    "SELECT payload FROM {}.migration_runs
                     ORDER BY start_time DESC, migration_id DESC
                     LIMIT $1",
                    self.schema
                ),
                &[&limit],
            )
            .await?;

        rows.iter()
            .map(|r| Self::decode(&r.get::<_, String>(0)))
            .collect()
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<MigrationRun>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT payload FROM {}.migration_runs
                     WHERE start_time >= $1
                     ORDER BY start_time DESC, migration_id DESC",
                    self.schema
                ),
                &[&since],
            )
            .await?;

        rows.iter()
            .map(|r| Self::decode(&r.get::<_, String>(0)))
            .collect()
    }

    async fn acquire_lease(&self, lease: &Lease) -> Result<()> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO {}.active_lease (migration_id, owner, acquired_at, renewed_at)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (singleton) DO NOTHING",
                    self.schema
                ),
                &[&lease.migration_id, &lease.owner, &lease.acquired_at, &lease.renewed_at],
            )
            .await?;

        if inserted == 1 {
            return Ok(());
        }
        let holder = self
            .current_lease()
            .await?
            .map(|l| l.migration_id)
            .unwrap_or_else(|| "unknown".to_string());
        Err(MigrateError::Conflict(holder))
    }

    async fn renew_lease(&self, migration_id: &str, owner: &str) -> Result<bool> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}.active_lease SET renewed_at = now()
                     WHERE migration_id = $1 AND owner = $2",
                    self.schema
                ),
                &[&migration_id, &owner],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn release_lease(&self, migration_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            &format!(
                "DELETE FROM {}.active_lease WHERE migration_id = $1",
                self.schema
            ),
            &[&migration_id],
        )
        .await?;
        Ok(())
    }

    async fn current_lease(&self) -> Result<Option<Lease>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT migration_id, owner, acquired_at, renewed_at FROM {}.active_lease",
                    self.schema
                ),
                &[],
            )
            .await?;

        Ok(row.map(|r| Lease {
            migration_id: r.get(0),
            owner: r.get(1),
            acquired_at: r.get(2),
            renewed_at: r.get(3),
        }))
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
