//! File-based history store.
//!
//! One JSON file per run under `<directory>/runs/`, signed with
//! HMAC-SHA256 so that hand-edited or truncated records are detected on
//! load. The active-run lease is `<directory>/lease.json`, created with
//! `create_new` so two processes cannot both take it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use tracing::{debug, warn};

use super::backend::{newest_first, HistoryStore, Lease};
use super::MigrationRun;
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

/// History store backed by signed JSON files.
pub struct FileHistoryStore {
    directory: PathBuf,
    key: Vec<u8>,
    write_lock: Mutex<()>,
}

impl FileHistoryStore {
    pub fn new(directory: impl Into<PathBuf>, integrity_key: &str) -> Self {
        Self {
            directory: directory.into(),
            key: integrity_key.as_bytes().to_vec(),
            write_lock: Mutex::new(()),
        }
    }

    fn runs_dir(&self) -> PathBuf {
        self.directory.join("runs")
    }

    fn lease_path(&self) -> PathBuf {
        self.directory.join("lease.json")
    }

    /// Path for a run record, or None when the id cannot be a file name.
    fn run_path(&self, migration_id: &str) -> Option<PathBuf> {
        let safe = !migration_id.is_empty()
            && migration_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.runs_dir().join(format!("{}.json", migration_id)))
    }

    /// Compute HMAC-SHA256 over the record with its signature unset.
    fn compute_hmac(&self, run: &MigrationRun) -> Result<String> {
        let mut unsigned = run.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| MigrateError::History(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn load(&self, path: &Path) -> Result<MigrationRun> {
        let content = fs::read_to_string(path)?;
        let run: MigrationRun = serde_json::from_str(&content)?;

        match &run.hmac {
            Some(stored) if *stored == self.compute_hmac(&run)? => Ok(run),
            Some(_) => Err(MigrateError::History(format!(
                "{}: integrity check failed (HMAC mismatch)",
                path.display()
            ))),
            None => Err(MigrateError::History(format!(
                "{}: record is not signed",
                path.display()
            ))),
        }
    }

    fn load_all(&self) -> Result<Vec<MigrationRun>> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load(&path) {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping history record {}: {}", path.display(), e),
            }
        }
        Ok(runs)
    }
}

/// Atomic write: write to temp file, then rename.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.runs_dir())?;
        debug!("History directory: {}", self.directory.display());
        Ok(())
    }

    async fn save(&self, run: &MigrationRun) -> Result<()> {
        let path = self.run_path(&run.migration_id).ok_or_else(|| {
            MigrateError::History(format!("invalid migration id '{}'", run.migration_id))
        })?;

        let mut signed = run.clone();
        signed.hmac = Some(self.compute_hmac(run)?);
        let content = serde_json::to_vec_pretty(&signed)?;

        let _guard = self.write_lock.lock();
        write_atomic(&path, &content)
    }

    async fn get(&self, migration_id: &str) -> Result<Option<MigrationRun>> {
        let path = match self.run_path(migration_id) {
            Some(p) if p.exists() => p,
            _ => return Ok(None),
        };
        self.load(&path).map(Some)
    }

    async fn list(&self, limit: usize) -> Result<Vec<MigrationRun>> {
        Ok(newest_first(self.load_all()?, limit))
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<MigrationRun>> {
        let runs = self
            .load_all()?
            .into_iter()
            .filter(|r| r.start_time >= since)
            .collect();
        Ok(newest_first(runs, usize::MAX))
    }

    async fn acquire_lease(&self, lease: &Lease) -> Result<()> {
        let path = self.lease_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec(lease)?)?;
                file.sync_all()?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = self
                    .current_lease()
                    .await?
                    .map(|l| l.migration_id)
                    .unwrap_or_else(|| "unknown".to_string());
                Err(MigrateError::Conflict(holder))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(&self, migration_id: &str, owner: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let content = match fs::read_to_string(self.lease_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut lease: Lease = match serde_json::from_str(&content) {
            Ok(lease) => lease,
            Err(_) => return Ok(false),
        };
        if lease.migration_id != migration_id || lease.owner != owner {
            return Ok(false);
        }
        lease.renewed_at = Utc::now();
        write_atomic(&self.lease_path(), &serde_json::to_vec(&lease)?)?;
        Ok(true)
    }

    async fn release_lease(&self, migration_id: &str) -> Result<()> {
        let path = self.lease_path();
        match self.current_lease().await? {
            Some(lease) if lease.migration_id == migration_id => {
                fs::remove_file(&path)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn current_lease(&self) -> Result<Option<Lease>> {
        let content = match fs::read_to_string(self.lease_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(lease) => Ok(Some(lease)),
            // A half-written lease file still blocks new runs until recovery.
            Err(_) => Ok(Some(Lease::orphaned("unknown"))),
        }
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationOptions;
    use crate::history::RunStatus;
    use tempfile::tempdir;

    async fn store(dir: &Path) -> FileHistoryStore {
        let store = FileHistoryStore::new(dir, "test-key");
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;

        let mut run = MigrationRun::new("run-1", MigrationOptions::default());
        run.status = RunStatus::Completed;
        run.statistics.progress_percentage = 66.66666666666667;
        store.save(&run).await.unwrap();

        let loaded = store.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.statistics, run.statistics);
        assert!(loaded.hmac.is_some());
    }

    #[tokio::test]
    async fn test_tampered_record_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;

        let mut run = MigrationRun::new("run-1", MigrationOptions::default());
        run.status = RunStatus::Failed;
        store.save(&run).await.unwrap();

        let path = dir.path().join("runs").join("run-1.json");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"Failed\"", "\"Completed\"")).unwrap();

        let err = store.get("run-1").await.unwrap_err();
        assert!(matches!(err, MigrateError::History(_)));
        // Listing skips the bad record instead of failing.
        assert!(store.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let dir = tempdir().unwrap();
        let store_a = store(dir.path()).await;
        store_a
            .save(&MigrationRun::new("run-1", MigrationOptions::default()))
            .await
            .unwrap();

        let store_b = FileHistoryStore::new(dir.path(), "other-key");
        assert!(store_b.get("run-1").await.is_err());
    }

    #[tokio::test]
    async fn test_unsafe_id_not_found() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;
        assert!(store.get("../etc/passwd").await.unwrap().is_none());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_survives_new_instance() {
        let dir = tempdir().unwrap();
        let first = store(dir.path()).await;
        first.acquire_lease(&Lease::new("run-1", "a")).await.unwrap();

        let second = store(dir.path()).await;
        let err = second.acquire_lease(&Lease::new("run-2", "b")).await.unwrap_err();
        assert!(matches!(err, MigrateError::Conflict(ref id) if id == "run-1"));

        second.release_lease("run-1").await.unwrap();
        assert!(second.current_lease().await.unwrap().is_none());
        second.acquire_lease(&Lease::new("run-2", "b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_lease_across_instances() {
        let dir = tempdir().unwrap();
        let first = store(dir.path()).await;
        let mut lease = Lease::new("run-1", "a");
        lease.renewed_at = lease.renewed_at - chrono::Duration::minutes(5);
        first.acquire_lease(&lease).await.unwrap();

        let second = store(dir.path()).await;
        assert!(!second.renew_lease("run-1", "b").await.unwrap());
        assert!(second.renew_lease("run-1", "a").await.unwrap());

        let renewed = first.current_lease().await.unwrap().unwrap();
        assert_eq!(renewed.acquired_at, lease.acquired_at);
        assert!(renewed.renewed_at > lease.renewed_at);
    }

    #[tokio::test]
    async fn test_list_since_filters() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;

        let mut old = MigrationRun::new("old", MigrationOptions::default());
        old.start_time = Utc::now() - chrono::Duration::days(40);
        store.save(&old).await.unwrap();
        store
            .save(&MigrationRun::new("new", MigrationOptions::default()))
            .await
            .unwrap();

        let recent = store
            .list_since(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].migration_id, "new");
    }
}
