//! Scripted removal of the authentication subsystem from the migrated
//! API and frontend projects.
//!
//! [`AuthRemovalPlanner::plan`] scans the configured project roots and
//! lists every file change up front. [`AuthRemovalPlanner::execute`] then
//! backs up every planned file, writes the backup manifest, and only then
//! modifies files one at a time. The removal notes are written last and
//! never fail the phase.

mod backup;
mod rules;

pub use backup::{
    create_backup, new_backup_id, restore, sha256_hex, BackupItem, BackupManifest, BackupResult, ManifestEntry, RollbackFailure,
    RollbackResult, MANIFEST_FILE,
};
pub use rules::NeutralizeKind;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{AuthRemovalConfig, AuthRemovalOptions, NameFilter};
use crate::error::{MigrateError, Result};
use crate::history::{ErrorLevel, MigrationError, Phase};
use crate::orchestrator::RunContext;

/// File name of the removal notes.
pub const NOTES_FILE: &str = "AUTHENTICATION_REMOVED.md";

/// Settings key holding the token configuration.
const JWT_SETTINGS_KEY: &str = "Jwt";

/// Directories never scanned.
const SKIPPED_DIRS: &[&str] = &["node_modules", "bin", "obj", ".git", "dist", ".angular", "coverage"];

/// Project a planned change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Area {
    Api,
    Frontend,
    Docs,
}

impl Area {
    fn dir(&self) -> &'static str {
        match self {
            Area::Api => "api",
            Area::Frontend => "frontend",
            Area::Docs => "docs",
        }
    }
}

/// Line rule set applied by [`RemovalAction::StripLines`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineRules {
    /// Token validation, middleware and service registrations in the API entry point.
    EntryPoint,
    /// `[Authorize]` attributes on controllers and actions.
    AuthorizeAttributes,
    /// `canActivate` guards in route tables.
    RouteGuards,
}

/// What a planned change does to its file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum RemovalAction {
    StripLines { rules: LineRules },
    RemoveJsonKey { key: String },
    Neutralize { kind: NeutralizeKind },
    WriteNotes,
}

/// One file change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedChange {
    pub path: PathBuf,
    pub area: Area,

    /// Path relative to the area root, with forward slashes.
    pub relative: String,
    pub action: RemovalAction,

    /// Components the change removes, as found at planning time.
    pub components: Vec<String>,
}

/// Every change the removal will make.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRemovalPlan {
    pub changes: Vec<PlannedChange>,

    /// Files skipped because they matched `filesToExclude`.
    pub excluded: Vec<PathBuf>,
}

impl AuthRemovalPlan {
    /// Changes to source files, in execution order.
    pub fn file_changes(&self) -> impl Iterator<Item = &PlannedChange> {
        self.changes
            .iter()
            .filter(|c| c.action != RemovalAction::WriteNotes)
    }

    /// The notes change, when documentation is updated.
    pub fn notes(&self) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.action == RemovalAction::WriteNotes)
    }
}

/// A timestamped audit line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub item: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    fn new(item: impl Into<String>, file: Option<&Path>) -> Self {
        Self {
            item: item.into(),
            file: file.map(|f| f.display().to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// A file that could not be changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileError {
    pub file: String,
    pub message: String,
}

/// Outcome of the auth removal phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRemovalResult {
    pub removed_components: Vec<AuditEntry>,
    pub modified_files: Vec<AuditEntry>,
    pub backup_files: Vec<AuditEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupResult>,
    pub documentation_updated: bool,
    pub errors: Vec<FileError>,
    pub success: bool,
}

/// Plans and executes authentication removal over the project roots.
#[derive(Debug, Clone, Default)]
pub struct AuthRemovalPlanner {
    roots: AuthRemovalConfig,
}

impl AuthRemovalPlanner {
    pub fn new(roots: AuthRemovalConfig) -> Self {
        Self { roots }
    }

    /// Scan the project roots and list every change.
    ///
    /// Fails when a configured root does not exist or an exclude pattern
    /// does not compile.
    pub fn plan(&self, options: &AuthRemovalOptions) -> Result<AuthRemovalPlan> {
        let excludes = NameFilter::new(&[], &options.files_to_exclude)?;
        let backup_dir = fs::canonicalize(&options.backup_directory).ok();
        let mut plan = AuthRemovalPlan::default();

        if options.remove_from_api {
            if let Some(root) = &self.roots.api_root {
                self.scan(root, Area::Api, &excludes, backup_dir.as_deref(), &mut plan)?;
            }
        }
        if options.remove_from_frontend {
            if let Some(root) = &self.roots.frontend_root {
                self.scan(root, Area::Frontend, &excludes, backup_dir.as_deref(), &mut plan)?;
            }
        }

        if options.update_documentation {
            let docs = self
                .roots
                .docs_root
                .as_ref()
                .or(self.roots.api_root.as_ref())
                .or(self.roots.frontend_root.as_ref());
            if let Some(dir) = docs {
                if !excludes.is_excluded(NOTES_FILE) {
                    plan.changes.push(PlannedChange {
                        path: dir.join(NOTES_FILE),
                        area: Area::Docs,
                        relative: NOTES_FILE.to_string(),
                        action: RemovalAction::WriteNotes,
                        components: Vec::new(),
                    });
                }
            }
        }

        info!(
            "Auth removal plan: {} changes, {} files excluded",
            plan.changes.len(),
            plan.excluded.len()
        );
        Ok(plan)
    }

    /// [`plan`](Self::plan) on the blocking pool, for async callers.
    pub async fn plan_blocking(&self, options: &AuthRemovalOptions) -> Result<AuthRemovalPlan> {
        let planner = self.clone();
        let options = options.clone();
        blocking(move || planner.plan(&options)).await
    }

    fn scan(
        &self,
        root: &Path,
        area: Area,
        excludes: &NameFilter,
        backup_dir: Option<&Path>,
        plan: &mut AuthRemovalPlan,
    ) -> Result<()> {
        if !root.is_dir() {
            return Err(MigrateError::Validation(format!(
                "{} root {} does not exist",
                area.dir(),
                root.display()
            )));
        }

        let mut found = Vec::new();
        let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
            if !e.file_type().is_dir() || e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            if SKIPPED_DIRS.contains(&name.as_ref()) {
                return false;
            }
            match (backup_dir, fs::canonicalize(e.path())) {
                (Some(backup), Ok(path)) => path != backup,
                _ => true,
            }
        });

        for entry in walker {
            let entry = entry.map_err(|e| MigrateError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let name = entry.file_name().to_string_lossy().to_string();

            let Some(action) = classify(area, &name) else {
                continue;
            };
            if excludes.is_excluded(&relative) || excludes.is_excluded(&name) {
                debug!("Excluded from auth removal: {}", relative);
                plan.excluded.push(path.to_path_buf());
                continue;
            }

            let content = match fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping unreadable {}: {}", path.display(), e);
                    continue;
                }
            };
            match rewrite(&action, &content) {
                Ok(Some((_, components))) => found.push(PlannedChange {
                    path: path.to_path_buf(),
                    area,
                    relative,
                    action,
                    components,
                }),
                Ok(None) => {}
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        plan.changes.extend(found);
        Ok(())
    }

    /// Back up, then modify every planned file.
    ///
    /// Without a complete backup (when `createBackup` is set) no file is
    /// touched. Per-file failures are recorded and the next file is
    /// processed. Cancel and pause are honoured between files.
    pub async fn execute(
        &self,
        plan: &AuthRemovalPlan,
        options: &AuthRemovalOptions,
        ctx: &RunContext,
    ) -> AuthRemovalResult {
        let mut result = AuthRemovalResult::default();
        let progress = ctx.reporter.progress();
        progress.add_files(plan.changes.len() as u64);

        if options.create_backup && plan.file_changes().next().is_some() {
            let root = PathBuf::from(&options.backup_directory);
            let backup_id = new_backup_id(&root);
            let items = plan
                .changes
                .iter()
                .map(|c| BackupItem {
                    original: c.path.clone(),
                    relative: format!("{}/{}", c.area.dir(), c.relative),
                })
                .collect();
            match create_backup(&root, &backup_id, items).await {
                Ok((manifest, backup)) => {
                    result.backup_files = manifest
                        .entries
                        .iter()
                        .filter(|e| e.existed)
                        .map(|e| AuditEntry {
                            item: e.backup_path.clone(),
                            file: Some(e.original_path.display().to_string()),
                            timestamp: e.backed_up_at,
                        })
                        .collect();
                    result.backup_id = Some(backup_id);
                    result.backup = Some(backup);
                }
                Err(e) => {
                    let message = format!("backup failed, no files were modified: {}", e);
                    ctx.reporter
                        .record(MigrationError::new(ErrorLevel::Fatal, Phase::AuthRemoval, message.clone()));
                    result.errors.push(FileError {
                        file: options.backup_directory.clone(),
                        message,
                    });
                    return result;
                }
            }
        }

        let mut cancelled = false;
        for change in plan.file_changes() {
            if !ctx.control.checkpoint().await {
                cancelled = true;
                break;
            }
            let owned = change.clone();
            match blocking(move || apply_change(&owned)).await {
                Ok(Some(components)) => {
                    let file = Some(change.path.as_path());
                    result.modified_files.push(AuditEntry::new(change.relative.clone(), file));
                    result
                        .removed_components
                        .extend(components.into_iter().map(|c| AuditEntry::new(c, file)));
                    info!("Removed authentication from {}", change.relative);
                }
                Ok(None) => debug!("{}: nothing left to remove", change.relative),
                Err(e) => {
                    ctx.reporter.record(
                        MigrationError::new(ErrorLevel::Error, Phase::AuthRemoval, e.to_string())
                            .with_file(change.path.display().to_string()),
                    );
                    result.errors.push(FileError {
                        file: change.path.display().to_string(),
                        message: e.to_string(),
                    });
                }
            }
            progress.file_done();
        }

        if let Some(notes) = plan.notes() {
            if !cancelled && !result.modified_files.is_empty() {
                let path = notes.path.clone();
                let snapshot = result.clone();
                match blocking(move || write_notes(&path, &snapshot)).await {
                    Ok(()) => {
                        result.documentation_updated = true;
                        result
                            .modified_files
                            .push(AuditEntry::new(notes.relative.clone(), Some(&notes.path)));
                    }
                    Err(e) => ctx.reporter.record(
                        MigrationError::new(
                            ErrorLevel::Warning,
                            Phase::AuthRemoval,
                            format!("documentation update failed: {}", e),
                        )
                        .with_file(notes.path.display().to_string()),
                    ),
                }
            }
            progress.file_done();
        }

        result.success = result.errors.is_empty() && !cancelled;
        info!(
            "Auth removal: {} files modified, {} components removed, {} errors",
            result.modified_files.len(),
            result.removed_components.len(),
            result.errors.len()
        );
        result
    }

    /// Restore a backup set written by [`execute`](Self::execute).
    pub fn rollback(backup_directory: &Path, backup_id: &str) -> Result<RollbackResult> {
        restore(backup_directory, backup_id)
    }
}

/// Action for a file, by name, before looking at its content.
fn classify(area: Area, name: &str) -> Option<RemovalAction> {
    let lower = name.to_ascii_lowercase();
    match area {
        Area::Api => {
            if name == "Program.cs" {
                Some(RemovalAction::StripLines {
                    rules: LineRules::EntryPoint,
                })
            } else if lower.starts_with("appsettings") && lower.ends_with(".json") {
                Some(RemovalAction::RemoveJsonKey {
                    key: JWT_SETTINGS_KEY.to_string(),
                })
            } else if lower.ends_with(".cs") {
                Some(RemovalAction::StripLines {
                    rules: LineRules::AuthorizeAttributes,
                })
            } else {
                None
            }
        }
        Area::Frontend => {
            if !lower.ends_with(".ts") || lower.ends_with(".spec.ts") {
                None
            } else if lower.contains("guard") {
                Some(RemovalAction::Neutralize {
                    kind: NeutralizeKind::Guard,
                })
            } else if lower.contains("interceptor") {
                Some(RemovalAction::Neutralize {
                    kind: NeutralizeKind::Interceptor,
                })
            } else if lower.contains("routes") || lower.contains("routing") {
                Some(RemovalAction::StripLines {
                    rules: LineRules::RouteGuards,
                })
            } else {
                None
            }
        }
        Area::Docs => None,
    }
}

/// Rewritten content and removed components, or `None` when the file has
/// nothing to remove.
fn rewrite(action: &RemovalAction, content: &str) -> Result<Option<(String, Vec<String>)>> {
    let (text, components) = match action {
        RemovalAction::StripLines { rules: set } => match set {
            LineRules::EntryPoint => rules::strip_program(content),
            LineRules::AuthorizeAttributes if rules::has_authorize(content) => rules::strip_authorize(content),
            LineRules::RouteGuards if rules::has_route_guards(content) => rules::strip_route_guards(content),
            _ => return Ok(None),
        },
        RemovalAction::RemoveJsonKey { key } => match rules::remove_json_key(content, key)? {
            Some(text) => (text, vec![format!("{} Settings", key)]),
            None => return Ok(None),
        },
        RemovalAction::Neutralize { kind } => {
            if *kind == NeutralizeKind::Interceptor && !rules::attaches_bearer(content) {
                return Ok(None);
            }
            if content.starts_with("// Authentication removed during migration") {
                return Ok(None);
            }
            rules::neutralize(content, *kind)
        }
        RemovalAction::WriteNotes => return Ok(None),
    };
    if components.is_empty() || text == content {
        return Ok(None);
    }
    Ok(Some((text, components)))
}

/// Run synchronous filesystem work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| MigrateError::Fatal(format!("auth removal task panicked: {}", e)))?
}

fn apply_change(change: &PlannedChange) -> Result<Option<Vec<String>>> {
    let content = fs::read_to_string(&change.path)?;
    match rewrite(&change.action, &content)? {
        Some((text, components)) => {
            backup::write_atomic(&change.path, text.as_bytes())?;
            Ok(Some(components))
        }
        None => Ok(None),
    }
}

fn write_notes(path: &Path, result: &AuthRemovalResult) -> Result<()> {
    let mut notes = String::new();
    notes.push_str("# Authentication Removed\n\n");
    notes.push_str(&format!(
        "Authentication was removed from this project on {}.\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));
    notes.push_str("Access control is now expected to be enforced outside the application.\n\n");

    notes.push_str("## Removed components\n\n");
    for c in &result.removed_components {
        match &c.file {
            Some(file) => notes.push_str(&format!("- {} ({})\n", c.item, file)),
            None => notes.push_str(&format!("- {}\n", c.item)),
        }
    }
    notes.push_str("\n## Modified files\n\n");
    for f in &result.modified_files {
        notes.push_str(&format!("- {}\n", f.item));
    }

    notes.push_str("\n## Restoring\n\n");
    match &result.backup_id {
        Some(id) => notes.push_str(&format!(
            "Original files are kept in backup `{}`. Restore them with:\n\n```\nlegacy-migrate rollback {}\n```\n",
            id, id
        )),
        None => notes.push_str("No backup was taken for this removal.\n"),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    backup::write_atomic(path, notes.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROGRAM: &str = "using Microsoft.AspNetCore.Authentication.JwtBearer;\nvar builder = WebApplication.CreateBuilder(args);\nbuilder.Services.AddAuthorization();\nvar app = builder.Build();\napp.UseAuthentication();\napp.UseAuthorization();\napp.MapControllers();\napp.Run();\n";

    struct Fixture {
        dir: TempDir,
        roots: AuthRemovalConfig,
        options: AuthRemovalOptions,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let api = dir.path().join("api");
        let web = dir.path().join("web/src/app");
        fs::create_dir_all(api.join("Controllers")).unwrap();
        fs::create_dir_all(api.join("bin")).unwrap();
        fs::create_dir_all(web.join("guards")).unwrap();
        fs::create_dir_all(web.join("interceptors")).unwrap();

        fs::write(api.join("Program.cs"), PROGRAM).unwrap();
        fs::write(api.join("bin/Program.cs"), PROGRAM).unwrap();
        fs::write(
            api.join("appsettings.json"),
            "{\n  \"Jwt\": {\"Key\": \"k\"},\n  \"AllowedHosts\": \"*\"\n}\n",
        )
        .unwrap();
        fs::write(
            api.join("Controllers/SamplesController.cs"),
            "[Authorize]\n[ApiController]\npublic class SamplesController {}\n",
        )
        .unwrap();
        fs::write(api.join("Controllers/HealthController.cs"), "public class HealthController {}\n").unwrap();
        fs::write(
            web.join("app.routes.ts"),
            "import { authGuard } from './guards/auth.guard';\nexport const routes = [\n  {\n    path: '',\n    canActivate: [authGuard],\n    children: []\n  }\n];\n",
        )
        .unwrap();
        fs::write(
            web.join("guards/auth.guard.ts"),
            "export const authGuard: CanActivateFn = () => inject(AuthService).isLoggedIn();\n",
        )
        .unwrap();
        fs::write(
            web.join("interceptors/error.interceptor.ts"),
            "export const errorInterceptor: HttpInterceptorFn = (req, next) => next(req);\n",
        )
        .unwrap();

        let roots = AuthRemovalConfig {
            api_root: Some(api),
            frontend_root: Some(dir.path().join("web")),
            docs_root: Some(dir.path().join("docs")),
        };
        let options = AuthRemovalOptions {
            backup_directory: dir.path().join("backups").display().to_string(),
            ..AuthRemovalOptions::default()
        };
        Fixture { dir, roots, options }
    }

    #[test]
    fn test_plan_lists_changes() {
        let f = fixture();
        let plan = AuthRemovalPlanner::new(f.roots.clone()).plan(&f.options).unwrap();
        let relatives: Vec<&str> = plan.changes.iter().map(|c| c.relative.as_str()).collect();
        assert_eq!(
            relatives,
            vec![
                "Controllers/SamplesController.cs",
                "Program.cs",
                "appsettings.json",
                "src/app/app.routes.ts",
                "src/app/guards/auth.guard.ts",
                NOTES_FILE,
            ]
        );
        assert_eq!(plan.notes().unwrap().area, Area::Docs);
    }

    #[test]
    fn test_plan_honours_excludes() {
        let mut f = fixture();
        f.options.files_to_exclude = vec!["appsettings*.json".into(), "Controllers/*".into()];
        let plan = AuthRemovalPlanner::new(f.roots.clone()).plan(&f.options).unwrap();
        assert!(plan.changes.iter().all(|c| !c.relative.contains("appsettings")));
        assert!(plan.changes.iter().all(|c| !c.relative.starts_with("Controllers")));
        assert_eq!(plan.excluded.len(), 3);
    }

    #[test]
    fn test_missing_root_fails_plan() {
        let f = fixture();
        let roots = AuthRemovalConfig {
            api_root: Some(f.dir.path().join("nowhere")),
            ..AuthRemovalConfig::default()
        };
        assert!(matches!(
            AuthRemovalPlanner::new(roots).plan(&f.options),
            Err(MigrateError::Validation(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_plan_blocking_matches_plan() {
        let f = fixture();
        let planner = AuthRemovalPlanner::new(f.roots.clone());
        let expected = planner.plan(&f.options).unwrap();
        let planned = planner.plan_blocking(&f.options).await.unwrap();
        assert_eq!(planned, expected);

        let roots = AuthRemovalConfig {
            api_root: Some(f.dir.path().join("nowhere")),
            ..AuthRemovalConfig::default()
        };
        assert!(matches!(
            AuthRemovalPlanner::new(roots).plan_blocking(&f.options).await,
            Err(MigrateError::Validation(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_execute_on_single_threaded_runtime() {
        let f = fixture();
        let planner = AuthRemovalPlanner::new(f.roots.clone());
        let plan = planner.plan_blocking(&f.options).await.unwrap();
        let ctx = RunContext::detached();
        let result = planner.execute(&plan, &f.options, &ctx).await;
        assert!(result.success, "{:?}", result.errors);

        let backup = result.backup.unwrap();
        let manifest = backup::load_manifest(backup.location.parent().unwrap(), &backup.backup_id).unwrap();
        assert_eq!(manifest.entries.iter().filter(|e| e.existed).count(), 5);
    }

    #[tokio::test]
    async fn test_execute_backs_up_before_modifying() {
        let f = fixture();
        let planner = AuthRemovalPlanner::new(f.roots.clone());
        let plan = planner.plan(&f.options).unwrap();
        let ctx = RunContext::detached();
        let result = planner.execute(&plan, &f.options, &ctx).await;

        assert!(result.success, "{:?}", result.errors);
        assert!(result.documentation_updated);
        assert_eq!(result.modified_files.len(), 6);
        assert_eq!(result.backup_files.len(), 5);
        let last_backup = result.backup_files.iter().map(|b| b.timestamp).max().unwrap();
        assert!(result.modified_files.iter().all(|m| m.timestamp > last_backup));

        let program = fs::read_to_string(f.roots.api_root.as_ref().unwrap().join("Program.cs")).unwrap();
        assert!(!program.contains("UseAuthentication"));
        assert!(program.contains("app.MapControllers();"));
        let untouched = fs::read_to_string(f.roots.api_root.as_ref().unwrap().join("bin/Program.cs")).unwrap();
        assert_eq!(untouched, PROGRAM);
        let notes = fs::read_to_string(f.dir.path().join("docs").join(NOTES_FILE)).unwrap();
        assert!(notes.contains(result.backup_id.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_rollback_restores_everything() {
        let f = fixture();
        let planner = AuthRemovalPlanner::new(f.roots.clone());
        let plan = planner.plan(&f.options).unwrap();
        let result = planner.execute(&plan, &f.options, &RunContext::detached()).await;
        let backup_id = result.backup_id.unwrap();

        let rollback = AuthRemovalPlanner::rollback(Path::new(&f.options.backup_directory), &backup_id).unwrap();
        assert!(rollback.success);
        let program = fs::read_to_string(f.roots.api_root.as_ref().unwrap().join("Program.cs")).unwrap();
        assert_eq!(program, PROGRAM);
        assert!(!f.dir.path().join("docs").join(NOTES_FILE).exists());
    }

    #[tokio::test]
    async fn test_per_file_failure_continues() {
        let f = fixture();
        let planner = AuthRemovalPlanner::new(f.roots.clone());
        let plan = planner.plan(&f.options).unwrap();
        // The settings file turns unreadable JSON after planning.
        fs::write(f.roots.api_root.as_ref().unwrap().join("appsettings.json"), "{ broken").unwrap();

        let ctx = RunContext::detached();
        let result = planner.execute(&plan, &f.options, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].file.ends_with("appsettings.json"));
        assert_eq!(result.modified_files.len(), 5);
        assert_eq!(ctx.reporter.error_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_files() {
        let f = fixture();
        let planner = AuthRemovalPlanner::new(f.roots.clone());
        let plan = planner.plan(&f.options).unwrap();
        let ctx = RunContext::detached();
        ctx.control.cancel();
        let result = planner.execute(&plan, &f.options, &ctx).await;
        assert!(result.modified_files.is_empty());
        assert!(result.backup_id.is_some());
        assert!(!result.success);
    }
}
