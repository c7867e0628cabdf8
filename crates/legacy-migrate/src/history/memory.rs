//! Process-local history store.
//!
//! Used by tests and by demo runs configured with `history.backend: memory`.
//! Records are lost when the process exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use super::backend::{newest_first, HistoryStore, Lease};
use super::MigrationRun;
use crate::error::{MigrateError, Result};

/// In-memory history store.
pub struct MemoryHistoryStore {
    runs: Mutex<HashMap<String, MigrationRun>>,
    lease: Mutex<Option<Lease>>,
    warned: AtomicBool,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            lease: Mutex::new(None),
            warned: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn init(&self) -> Result<()> {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!("Using in-memory history store: run history will not survive a restart");
        }
        Ok(())
    }

    async fn save(&self, run: &MigrationRun) -> Result<()> {
        self.runs
            .lock()
            .insert(run.migration_id.clone(), run.clone());
        Ok(())
    }

    async fn get(&self, migration_id: &str) -> Result<Option<MigrationRun>> {
        Ok(self.runs.lock().get(migration_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<MigrationRun>> {
        let runs = self.runs.lock().values().cloned().collect();
        Ok(newest_first(runs, limit))
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<MigrationRun>> {
        let runs = self
            .runs
            .lock()
            .values()
            .filter(|r| r.start_time >= since)
            .cloned()
            .collect();
        Ok(newest_first(runs, usize::MAX))
    }

    async fn acquire_lease(&self, lease: &Lease) -> Result<()> {
        let mut current = self.lease.lock();
        if let Some(held) = current.as_ref() {
            return Err(MigrateError::Conflict(held.migration_id.clone()));
        }
        *current = Some(lease.clone());
        Ok(())
    }

    async fn renew_lease(&self, migration_id: &str, owner: &str) -> Result<bool> {
        let mut current = self.lease.lock();
        match current.as_mut() {
            Some(lease) if lease.migration_id == migration_id && lease.owner == owner => {
                lease.renewed_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, migration_id: &str) -> Result<()> {
        let mut current = self.lease.lock();
        if current
            .as_ref()
            .is_some_and(|l| l.migration_id == migration_id)
        {
            *current = None;
        }
        Ok(())
    }

    async fn current_lease(&self) -> Result<Option<Lease>> {
        Ok(self.lease.lock().clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationOptions;

    #[tokio::test]
    async fn test_lease_is_single_flight() {
        let store = MemoryHistoryStore::new();
        store.acquire_lease(&Lease::new("a", "owner")).await.unwrap();

        let err = store.acquire_lease(&Lease::new("b", "owner")).await.unwrap_err();
        assert!(matches!(err, MigrateError::Conflict(ref id) if id == "a"));

        // Releasing with the wrong id is a no-op.
        store.release_lease("b").await.unwrap();
        assert!(store.current_lease().await.unwrap().is_some());

        store.release_lease("a").await.unwrap();
        store.acquire_lease(&Lease::new("b", "owner")).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_lease_only_for_holder() {
        let store = MemoryHistoryStore::new();
        let mut lease = Lease::new("a", "owner");
        lease.renewed_at = lease.renewed_at - chrono::Duration::minutes(5);
        store.acquire_lease(&lease).await.unwrap();

        assert!(!store.renew_lease("a", "someone-else").await.unwrap());
        assert!(!store.renew_lease("b", "owner").await.unwrap());
        assert!(store.renew_lease("a", "owner").await.unwrap());

        let renewed = store.current_lease().await.unwrap().unwrap();
        assert!(renewed.renewed_at > lease.renewed_at);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = MemoryHistoryStore::new();
        let mut run = MigrationRun::new("a", MigrationOptions::default());
        store.save(&run).await.unwrap();
        run.current_operation = "Seeding data".into();
        store.save(&run).await.unwrap();

        let runs = store.list(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].current_operation, "Seeding data");
    }
}
