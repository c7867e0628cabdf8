//! History store trait for migration run records.
//!
//! The [`HistoryStore`] trait defines how run records and the active-run
//! lease are persisted. Implementations:
//!
//! - **File**: HMAC-signed JSON files, `FileHistoryStore` in `file.rs`
//! - **PostgreSQL**: `PgHistoryStore` in `db.rs`
//! - **Memory**: `MemoryHistoryStore` in `memory.rs`, not durable
//!
//! The orchestrator works with `Arc<dyn HistoryStore>` without knowing the
//! concrete type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MigrationRun, RunStatus};
use crate::error::{MigrateError, Result};

/// The single active-run lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Run holding the lease.
    pub migration_id: String,

    /// Orchestrator instance that owns the run.
    pub owner: String,

    pub acquired_at: DateTime<Utc>,

    /// Last heartbeat from the owner. A lease not renewed within its time
    /// to live belongs to a dead process.
    #[serde(default = "unrenewed")]
    pub renewed_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(migration_id: &str, owner: &str) -> Self {
        let now = Utc::now();
        Self {
            migration_id: migration_id.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            renewed_at: now,
        }
    }

    /// A lease that can no longer be attributed to a live owner.
    pub fn orphaned(migration_id: &str) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            owner: "unknown".to_string(),
            acquired_at: unrenewed(),
            renewed_at: unrenewed(),
        }
    }

    /// Whether the owner missed its heartbeats for longer than `ttl`.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.renewed_at) > ttl
    }
}

fn unrenewed() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

/// Trait for run history persistence backends.
///
/// Records are append/update-only: a run is inserted when requested and
/// overwritten as it progresses. Nothing is ever deleted.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create directories or tables. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Insert or replace a run record.
    async fn save(&self, run: &MigrationRun) -> Result<()>;

    /// Load a run by id.
    async fn get(&self, migration_id: &str) -> Result<Option<MigrationRun>>;

    /// Most recent runs first, at most `limit`.
    async fn list(&self, limit: usize) -> Result<Vec<MigrationRun>>;

    /// Runs started at or after `since`, newest first.
    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<MigrationRun>>;

    /// Take the active-run lease.
    ///
    /// Fails with [`MigrateError::Conflict`] naming the holder when another
    /// run already has it.
    async fn acquire_lease(&self, lease: &Lease) -> Result<()>;

    /// Refresh the heartbeat of a lease held by `migration_id` and `owner`.
    ///
    /// Returns false when the lease is no longer theirs.
    async fn renew_lease(&self, migration_id: &str, owner: &str) -> Result<bool>;

    /// Release the lease if `migration_id` holds it.
    async fn release_lease(&self, migration_id: &str) -> Result<()>;

    /// Current lease holder, if any.
    async fn current_lease(&self) -> Result<Option<Lease>>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Helper function to convert RunStatus to string representation.
pub fn run_status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::NotStarted => "not_started",
        RunStatus::InProgress => "in_progress",
        RunStatus::Paused => "paused",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

/// Helper function to parse RunStatus from string.
pub fn str_to_run_status(s: &str) -> Result<RunStatus> {
    match s {
        "not_started" => Ok(RunStatus::NotStarted),
        "in_progress" => Ok(RunStatus::InProgress),
        "paused" => Ok(RunStatus::Paused),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        _ => Err(MigrateError::History(format!("Invalid run status: {}", s))),
    }
}

/// Keep the newest `limit` runs, newest first.
pub(crate) fn newest_first(mut runs: Vec<MigrationRun>, limit: usize) -> Vec<MigrationRun> {
    runs.sort_by(|a, b| {
        b.start_time
            .cmp(&a.start_time)
            .then_with(|| b.migration_id.cmp(&a.migration_id))
    });
    runs.truncate(limit);
    runs
}
