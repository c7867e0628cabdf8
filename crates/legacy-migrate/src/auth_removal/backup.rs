//! Backup sets for auth removal and their restore.
//!
//! A backup set lives in `<backupDirectory>/<backupId>/` and holds a copy
//! of every file the removal will touch under `files/<area>/<relative path>`
//! plus a `manifest.json` listing each original path, its copy and the
//! SHA-256 of the copy. Files the removal creates are listed with
//! `existed: false` so a rollback can delete them again.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{MigrateError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// One file in a backup set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub original_path: PathBuf,

    /// Path of the copy, relative to the backup set directory.
    pub backup_path: String,

    /// SHA-256 of the copy. Absent for files that did not exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub existed: bool,
    pub size: u64,
    pub backed_up_at: DateTime<Utc>,
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

/// Summary of a written backup set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub backup_id: String,
    pub location: PathBuf,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// A file that could not be restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of restoring a backup set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub backup_id: String,
    pub restored: Vec<PathBuf>,
    pub failed: Vec<RollbackFailure>,
    pub success: bool,
}

/// A file to back up: its current location and its place in the set.
#[derive(Debug, Clone)]
pub struct BackupItem {
    pub original: PathBuf,
    pub relative: String,
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `id` is usable as a single directory name.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// New backup id, unique within `root`.
pub fn new_backup_id(root: &Path) -> String {
    let base = format!("auth_backup_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    if !root.join(&base).exists() {
        return base;
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|id| !root.join(id).exists())
        .unwrap_or(base)
}

/// Write `content` to `path` through a temporary file and a rename.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
    if let Err(e) = write_synced(&temp_path, content) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Write `content` and flush it to disk before returning.
fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Copy every item into a new backup set and write its manifest.
///
/// Copies run in parallel. The manifest is written last, so a set with a
/// manifest is complete. Any copy failure fails the whole backup.
pub async fn create_backup(root: &Path, backup_id: &str, items: Vec<BackupItem>) -> Result<(BackupManifest, BackupResult)> {
    let set_dir = root.join(backup_id);
    fs::create_dir_all(set_dir.join("files"))?;

    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let set_dir = set_dir.clone();
        handles.push(tokio::task::spawn_blocking(move || copy_one(&set_dir, item)));
    }

    let mut entries = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(Ok(entry)) => entries.push(entry),
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(MigrateError::Fatal(format!("backup task panicked: {}", e))),
        }
    }

    let manifest = BackupManifest {
        backup_id: backup_id.to_string(),
        created_at: Utc::now(),
        entries,
    };
    let manifest_path = set_dir.join(MANIFEST_FILE);
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    tokio::task::spawn_blocking(move || write_atomic(&manifest_path, &manifest_bytes))
        .await
        .map_err(|e| MigrateError::Fatal(format!("backup task panicked: {}", e)))??;

    let result = BackupResult {
        backup_id: backup_id.to_string(),
        location: set_dir,
        file_count: manifest.entries.iter().filter(|e| e.existed).count(),
        total_bytes: manifest.entries.iter().map(|e| e.size).sum(),
    };
    info!(
        "Backup {} written: {} files, {} bytes",
        backup_id, result.file_count, result.total_bytes
    );
    Ok((manifest, result))
}

fn copy_one(set_dir: &Path, item: BackupItem) -> Result<ManifestEntry> {
    let backup_path = format!("files/{}", item.relative.replace('\\', "/"));
    if !item.original.exists() {
        return Ok(ManifestEntry {
            original_path: item.original,
            backup_path,
            sha256: None,
            existed: false,
            size: 0,
            backed_up_at: Utc::now(),
        });
    }

    let data = fs::read(&item.original)?;
    let target = set_dir.join(&backup_path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    write_synced(&target, &data)?;
    debug!("Backed up {}", item.original.display());
    Ok(ManifestEntry {
        original_path: item.original,
        backup_path,
        sha256: Some(sha256_hex(&data)),
        existed: true,
        size: data.len() as u64,
        backed_up_at: Utc::now(),
    })
}

/// Read the manifest of a backup set.
pub fn load_manifest(root: &Path, backup_id: &str) -> Result<BackupManifest> {
    if !is_safe_id(backup_id) {
        return Err(MigrateError::NotFound(format!("backup {}", backup_id)));
    }
    let path = root.join(backup_id).join(MANIFEST_FILE);
    if !path.exists() {
        return Err(MigrateError::NotFound(format!("backup {}", backup_id)));
    }
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Restore every file of a backup set.
///
/// All copies are verified against their manifest digests first; if any
/// is missing or altered nothing is restored and the failing copies are
/// reported. Files the removal created are deleted.
pub fn restore(root: &Path, backup_id: &str) -> Result<RollbackResult> {
    let manifest = load_manifest(root, backup_id)?;
    let set_dir = root.join(backup_id);

    let mut verified = Vec::with_capacity(manifest.entries.len());
    let mut failed = Vec::new();
    for entry in &manifest.entries {
        if !entry.existed {
            verified.push((entry, None));
            continue;
        }
        match fs::read(set_dir.join(&entry.backup_path)) {
            Ok(data) if entry.sha256.as_deref() == Some(sha256_hex(&data).as_str()) => {
                verified.push((entry, Some(data)))
            }
            Ok(_) => failed.push(RollbackFailure {
                path: entry.original_path.clone(),
                reason: "backup copy does not match its digest".into(),
            }),
            Err(e) => failed.push(RollbackFailure {
                path: entry.original_path.clone(),
                reason: format!("backup copy unreadable: {}", e),
            }),
        }
    }

    if !failed.is_empty() {
        warn!(
            "Rollback of {} refused: {} backup copies failed verification",
            backup_id,
            failed.len()
        );
        return Ok(RollbackResult {
            backup_id: backup_id.to_string(),
            restored: Vec::new(),
            failed,
            success: false,
        });
    }

    let mut restored = Vec::new();
    for (entry, data) in verified {
        let outcome = match data {
            Some(data) => entry
                .original_path
                .parent()
                .map(fs::create_dir_all)
                .transpose()
                .map_err(MigrateError::from)
                .and_then(|_| write_atomic(&entry.original_path, &data)),
            None if entry.original_path.exists() => fs::remove_file(&entry.original_path).map_err(MigrateError::from),
            None => Ok(()),
        };
        match outcome {
            Ok(()) => restored.push(entry.original_path.clone()),
            Err(e) => failed.push(RollbackFailure {
                path: entry.original_path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    info!(
        "Rollback of {}: {} restored, {} failed",
        backup_id,
        restored.len(),
        failed.len()
    );
    Ok(RollbackResult {
        backup_id: backup_id.to_string(),
        success: failed.is_empty(),
        restored,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(path: &Path, relative: &str) -> BackupItem {
        BackupItem {
            original: path.to_path_buf(),
            relative: relative.to_string(),
        }
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("backups");
        let program = dir.path().join("Program.cs");
        let notes = dir.path().join("NOTES.md");
        fs::write(&program, "app.UseAuthentication();\n").unwrap();

        let (manifest, result) = create_backup(
            &root,
            "auth_backup_test",
            vec![item(&program, "api/Program.cs"), item(&notes, "docs/NOTES.md")],
        )
        .await
        .unwrap();
        assert_eq!(result.file_count, 1);
        assert_eq!(manifest.entries.len(), 2);
        assert!(root.join("auth_backup_test").join(MANIFEST_FILE).exists());

        fs::write(&program, "// stripped\n").unwrap();
        fs::write(&notes, "removed").unwrap();

        let rollback = restore(&root, "auth_backup_test").unwrap();
        assert!(rollback.success);
        assert_eq!(rollback.restored.len(), 2);
        assert_eq!(fs::read_to_string(&program).unwrap(), "app.UseAuthentication();\n");
        assert!(!notes.exists());
    }

    #[tokio::test]
    async fn test_corrupt_copy_restores_nothing() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("backups");
        let a = dir.path().join("a.cs");
        let b = dir.path().join("b.cs");
        fs::write(&a, "original a").unwrap();
        fs::write(&b, "original b").unwrap();

        create_backup(&root, "set1", vec![item(&a, "api/a.cs"), item(&b, "api/b.cs")])
            .await
            .unwrap();
        fs::write(&a, "changed a").unwrap();
        fs::write(&b, "changed b").unwrap();
        fs::write(root.join("set1/files/api/b.cs"), "tampered").unwrap();

        let rollback = restore(&root, "set1").unwrap();
        assert!(!rollback.success);
        assert!(rollback.restored.is_empty());
        assert_eq!(rollback.failed.len(), 1);
        assert_eq!(rollback.failed[0].path, b);
        assert_eq!(fs::read_to_string(&a).unwrap(), "changed a");
    }

    #[test]
    fn test_unknown_or_unsafe_backup_id() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(restore(dir.path(), "missing"), Err(MigrateError::NotFound(_))));
        assert!(matches!(restore(dir.path(), "../etc"), Err(MigrateError::NotFound(_))));
    }

    #[test]
    fn test_backup_ids_are_unique() {
        let dir = TempDir::new().unwrap();
        let first = new_backup_id(dir.path());
        fs::create_dir_all(dir.path().join(&first)).unwrap();
        let second = new_backup_id(dir.path());
        assert_ne!(first, second);
        assert!(second.starts_with(&first));
        assert!(is_safe_id(&second));
    }
}
