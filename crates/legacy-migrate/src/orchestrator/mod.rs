//! Migration orchestrator - main workflow coordinator.
//!
//! Owns the single active run: takes the history lease, drives Seeding,
//! Validation and AuthRemoval in order, publishes live snapshots for
//! pollers and writes the finished record back to the history store.

mod control;
mod progress;

pub use control::{RunContext, RunControl, RunReporter};
pub use progress::{ProgressTracker, ProgressView};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::auth_removal::{AuthRemovalPlanner, RollbackResult};
use crate::config::{
    validate_options, AuthRemovalConfig, Config, MigrationOptions, QueryConfig, SystemResources,
};
use crate::core::{LegacySource, Table, TargetStore};
use crate::drivers::{self, PgStore};
use crate::error::{MigrateError, Result};
use crate::history::{
    self, ErrorLevel, HistoryStatistics, HistoryStore, Lease, MigrationError, MigrationRun, Phase,
    RunStatus,
};
use crate::logging::LogBuffer;
use crate::report::{self, LogLevelFilter, RenderedReport, ReportFormat};
use crate::seeder::BatchSeeder;
use crate::verify::{DifferentialValidator, QueryDefinition};

/// Runs scanned by startup recovery and backup lookup.
const HISTORY_SCAN_LIMIT: usize = 10_000;

/// Shortest interval between lease heartbeats.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Everything a run needs from the service configuration besides the
/// stores themselves.
#[derive(Clone)]
pub struct RunSettings {
    /// Named comparison queries for the validation phase.
    pub queries: Vec<QueryConfig>,

    /// Project roots scanned by the auth removal phase.
    pub auth_roots: AuthRemovalConfig,

    /// Options used when a start request carries none.
    pub default_options: MigrationOptions,

    /// Schema used for an alternate legacy endpoint.
    pub legacy_schema: String,

    /// Hash of the service configuration, stamped on each run.
    pub config_hash: Option<String>,

    /// Detected CPU cores, for the oversubscription warning.
    pub cpu_cores: Option<usize>,

    /// Captured log lines served by [`Orchestrator::logs`].
    pub log_buffer: Option<LogBuffer>,

    /// Age of the last heartbeat after which another instance may treat a
    /// lease as abandoned.
    pub lease_ttl: Duration,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queries: config.queries.clone(),
            auth_roots: config.auth_removal.clone(),
            default_options: config.default_options(),
            legacy_schema: config.legacy.schema.clone(),
            config_hash: Some(config.hash()),
            cpu_cores: Some(SystemResources::detect().cpu_cores),
            log_buffer: None,
            lease_ttl: Duration::from_secs(config.history.lease_ttl_secs),
        }
    }

    pub fn with_log_buffer(mut self, buffer: LogBuffer) -> Self {
        self.log_buffer = Some(buffer);
        self
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            queries: Vec::new(),
            auth_roots: AuthRemovalConfig::default(),
            default_options: MigrationOptions::default(),
            legacy_schema: "public".to_string(),
            config_hash: None,
            cpu_cores: None,
            log_buffer: None,
            lease_ttl: Duration::from_secs(60),
        }
    }
}

/// State of the run this instance is driving (or drove last).
struct ActiveRun {
    id: String,
    ctx: RunContext,
    record: Mutex<MigrationRun>,
    timed_out: AtomicBool,
    done: watch::Sender<bool>,
}

impl ActiveRun {
    fn is_finished(&self) -> bool {
        self.record.lock().status.is_terminal()
    }

    /// Record with live status, errors and statistics merged in.
    fn snapshot(&self) -> MigrationRun {
        let mut run = self.record.lock().clone();
        if run.status.is_active() {
            let control = &self.ctx.control;
            run.status = if control.is_paused() && !control.is_cancelled() {
                RunStatus::Paused
            } else {
                RunStatus::InProgress
            };
            run.current_operation = self.ctx.reporter.operation();
            run.errors = self.ctx.reporter.errors();
            run.statistics = self
                .ctx
                .reporter
                .progress()
                .snapshot(run.errors.len() as u64);
        }
        run
    }

    /// Cancel the run once `timeout` has passed.
    async fn expire_after(self: Arc<Self>, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        warn!("Migration {} exceeded its {}s budget", self.id, timeout.as_secs());
        self.timed_out.store(true, Ordering::SeqCst);
        self.ctx.control.cancel();
    }
}

struct Inner {
    legacy: Arc<dyn LegacySource>,
    target: Arc<dyn TargetStore>,
    history: Arc<dyn HistoryStore>,
    settings: RunSettings,
    owner: String,
    slot: Mutex<Option<Arc<ActiveRun>>>,
}

/// Migration orchestrator.
///
/// Cheap to clone; all clones share the same active-run slot.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        legacy: Arc<dyn LegacySource>,
        target: Arc<dyn TargetStore>,
        history: Arc<dyn HistoryStore>,
        settings: RunSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                legacy,
                target,
                history,
                settings,
                owner: uuid::Uuid::new_v4().to_string(),
                slot: Mutex::new(None),
            }),
        }
    }

    /// Connect the stores and history backend named in `config`.
    pub async fn from_config(config: &Config, log_buffer: Option<LogBuffer>) -> Result<Self> {
        let legacy = drivers::connect_legacy(&config.legacy).await?;
        let target = drivers::connect_target(&config.target).await?;
        let history = history::open(config).await?;

        let mut settings = RunSettings::from_config(config);
        settings.log_buffer = log_buffer;
        Ok(Self::new(legacy, target, history, settings))
    }

    /// Options used when a start request carries none.
    pub fn default_options(&self) -> MigrationOptions {
        self.inner.settings.default_options.clone()
    }

    /// Whether the legacy source and the target store answer a ping.
    pub async fn ping_stores(&self) -> (bool, bool) {
        let (legacy, target) = tokio::join!(self.inner.legacy.ping(), self.inner.target.ping());
        (legacy.is_ok(), target.is_ok())
    }

    pub fn history_backend(&self) -> &'static str {
        self.inner.history.backend_type()
    }

    /// Mark runs left active by a dead process as failed and release
    /// their lease. Returns the number of runs recovered.
    ///
    /// A lease renewed within the lease TTL belongs to a live instance;
    /// its run is left alone.
    pub async fn recover(&self) -> Result<usize> {
        let history = &self.inner.history;
        let ttl = ChronoDuration::milliseconds(self.inner.settings.lease_ttl.as_millis() as i64);
        let mut live = None;

        if let Some(lease) = history.current_lease().await? {
            if lease.owner == self.inner.owner || !lease.is_stale(Utc::now(), ttl) {
                info!(
                    "Run {} holds a live lease (owner {}), leaving it running",
                    lease.migration_id, lease.owner
                );
                live = Some(lease.migration_id);
            } else {
                info!(
                    "Releasing stale lease held by run {}, last renewed {}",
                    lease.migration_id, lease.renewed_at
                );
                history.release_lease(&lease.migration_id).await?;
            }
        }

        let mut recovered = 0;
        for mut run in history.list(HISTORY_SCAN_LIMIT).await? {
            if !run.status.is_active() || live.as_deref() == Some(run.migration_id.as_str()) {
                continue;
            }
            warn!(
                "Run {} was left {:?} by a previous process, marking it Failed",
                run.migration_id, run.status
            );
            run.errors.push(MigrationError::new(
                ErrorLevel::Fatal,
                Phase::Finalization,
                format!("interrupted: orchestrator stopped while the run was {:?}", run.status),
            ));
            run.status = RunStatus::Failed;
            run.end_time = Some(Utc::now());
            run.statistics.error_count = run.errors.len() as u64;
            history.save(&run).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Validate `options`, take the lease and start a run in the background.
    pub async fn start(&self, options: MigrationOptions) -> Result<String> {
        for warning in validate_options(&options, self.inner.settings.cpu_cores)? {
            warn!("{}", warning);
        }
        if let Some(active) = self.active() {
            return Err(MigrateError::Conflict(active.id.clone()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let history = &self.inner.history;
        history
            .acquire_lease(&Lease::new(&id, &self.inner.owner))
            .await?;

        let mut record = MigrationRun::new(&id, options.clone());
        record.status = RunStatus::InProgress;
        record.config_hash = self.inner.settings.config_hash.clone();
        if let Err(e) = history.save(&record).await {
            if let Err(release) = history.release_lease(&id).await {
                error!("Failed to release lease for {}: {}", id, release);
            }
            return Err(e);
        }

        let (done, _) = watch::channel(false);
        let run = Arc::new(ActiveRun {
            id: id.clone(),
            ctx: RunContext::new(&id),
            record: Mutex::new(record),
            timed_out: AtomicBool::new(false),
            done,
        });
        *self.inner.slot.lock() = Some(run.clone());

        info!("Starting migration run: {}", id);
        let this = self.clone();
        let span = info_span!("migration", migration_id = %id);
        let timeout = options.operation_timeout();
        tokio::spawn(
            async move {
                let watcher = tokio::spawn(run.clone().expire_after(timeout).in_current_span());
                let heartbeat = tokio::spawn(this.clone().heartbeat(run.id.clone()).in_current_span());
                let phases = tokio::spawn(this.clone().drive(run.clone(), options).in_current_span());
                let outcome = phases.await;
                watcher.abort();
                heartbeat.abort();
                if let Err(e) = outcome {
                    let message = if e.is_panic() {
                        format!("run task panicked: {}", e)
                    } else {
                        format!("run task aborted: {}", e)
                    };
                    run.ctx
                        .reporter
                        .record(MigrationError::new(ErrorLevel::Fatal, Phase::Finalization, message));
                }
                this.finalize(&run).await;
            }
            .instrument(span),
        );

        Ok(id)
    }

    /// Start a run and wait for it to finish.
    pub async fn run_to_completion(&self, options: MigrationOptions) -> Result<MigrationRun> {
        let id = self.start(options).await?;
        self.wait(&id).await
    }

    /// Wait until the run is terminal and return its record.
    pub async fn wait(&self, migration_id: &str) -> Result<MigrationRun> {
        if let Some(run) = self.slot_run(migration_id) {
            let mut rx = run.done.subscribe();
            // The sender lives in `run`, so this only ends on `true`.
            let _ = rx.wait_for(|done| *done).await;
            return Ok(run.snapshot());
        }
        self.status(migration_id).await
    }

    /// Live snapshot of the run, or its stored record once finished.
    pub async fn status(&self, migration_id: &str) -> Result<MigrationRun> {
        if let Some(run) = self.slot_run(migration_id) {
            return Ok(run.snapshot());
        }
        self.inner
            .history
            .get(migration_id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("migration {}", migration_id)))
    }

    /// The active run, if any.
    pub fn current(&self) -> Option<MigrationRun> {
        self.active().map(|run| run.snapshot())
    }

    /// Progress of the active run, if any.
    pub fn progress(&self) -> Option<ProgressView> {
        self.active().map(|run| {
            let snapshot = run.snapshot();
            ProgressView::new(
                &run.id,
                snapshot.status,
                snapshot.current_operation,
                &snapshot.statistics,
            )
        })
    }

    /// Hold the run at its next batch, query or file boundary.
    pub async fn pause(&self, migration_id: &str) -> Result<()> {
        let run = self.controllable(migration_id).await?;
        let control = &run.ctx.control;
        if control.is_cancelled() {
            return Err(MigrateError::InvalidState(format!(
                "migration {} is being cancelled",
                migration_id
            )));
        }
        if control.is_paused() {
            return Err(MigrateError::InvalidState(format!(
                "migration {} is already paused",
                migration_id
            )));
        }
        control.pause();
        info!("Migration {} paused", migration_id);
        self.persist(&run).await;
        Ok(())
    }

    pub async fn resume(&self, migration_id: &str) -> Result<()> {
        let run = self.controllable(migration_id).await?;
        let control = &run.ctx.control;
        if !control.is_paused() || control.is_cancelled() {
            return Err(MigrateError::InvalidState(format!(
                "migration {} is not paused",
                migration_id
            )));
        }
        control.resume();
        info!("Migration {} resumed", migration_id);
        self.persist(&run).await;
        Ok(())
    }

    /// Stop starting new units; in-flight units finish and the run ends
    /// Cancelled.
    pub async fn cancel(&self, migration_id: &str) -> Result<()> {
        let run = self.controllable(migration_id).await?;
        if run.ctx.control.is_cancelled() {
            return Err(MigrateError::InvalidState(format!(
                "migration {} is already being cancelled",
                migration_id
            )));
        }
        run.ctx.control.cancel();
        info!("Migration {} cancellation requested", migration_id);
        Ok(())
    }

    /// Most recent runs first, with the active run as a live snapshot.
    pub async fn history(&self, limit: usize) -> Result<Vec<MigrationRun>> {
        let mut runs = self.inner.history.list(limit).await?;
        if let Some(active) = self.active() {
            for run in runs.iter_mut() {
                if run.migration_id == active.id {
                    *run = active.snapshot();
                }
            }
        }
        Ok(runs)
    }

    /// Aggregates over runs started in the last `window_days` days.
    pub async fn statistics(&self, window_days: u32) -> Result<HistoryStatistics> {
        let since = Utc::now() - ChronoDuration::days(i64::from(window_days));
        let runs = self.inner.history.list_since(since).await?;
        Ok(HistoryStatistics::from_runs(&runs, window_days))
    }

    /// Render a run report.
    pub async fn report(&self, migration_id: &str, format: ReportFormat) -> Result<RenderedReport> {
        let run = self.status(migration_id).await?;
        report::render(&run, format)
    }

    /// Plain-text log of a run.
    ///
    /// Uses captured log lines when this process drove the run, and the
    /// recorded errors otherwise.
    pub async fn logs(&self, migration_id: &str, filter: LogLevelFilter) -> Result<String> {
        let run = self.status(migration_id).await?;
        let lines = self
            .inner
            .settings
            .log_buffer
            .as_ref()
            .map(|buffer| buffer.lines(migration_id))
            .unwrap_or_default();
        Ok(report::render_logs(&run, &lines, filter))
    }

    /// Restore an auth removal backup.
    ///
    /// The backup is looked up in the directory the run that took it wrote
    /// to, or in the default backup directory when no run records it.
    pub async fn rollback(&self, backup_id: &str) -> Result<RollbackResult> {
        if let Some(active) = self.active() {
            return Err(MigrateError::Conflict(active.id.clone()));
        }
        let directory = self.backup_directory(backup_id).await?;
        let id = backup_id.to_string();
        let result = tokio::task::spawn_blocking(move || AuthRemovalPlanner::rollback(&directory, &id))
            .await
            .map_err(|e| MigrateError::Fatal(format!("rollback task failed: {}", e)))??;

        if result.success {
            info!(
                "Rolled back backup {}: {} files restored",
                result.backup_id,
                result.restored.len()
            );
        } else {
            warn!(
                "Rollback of backup {} refused: {} files failed verification",
                result.backup_id,
                result.failed.len()
            );
        }
        Ok(result)
    }

    async fn backup_directory(&self, backup_id: &str) -> Result<PathBuf> {
        let runs = self.inner.history.list(HISTORY_SCAN_LIMIT).await?;
        let recorded = runs.iter().find_map(|run| {
            let result = run.auth_removal_result.as_ref()?;
            if result.backup_id.as_deref() != Some(backup_id) {
                return None;
            }
            let written = result
                .backup
                .as_ref()
                .and_then(|b| b.location.parent())
                .map(Path::to_path_buf);
            Some(written.unwrap_or_else(|| PathBuf::from(&run.options.auth_removal.backup_directory)))
        });
        Ok(recorded.unwrap_or_else(|| {
            PathBuf::from(&self.inner.settings.default_options.auth_removal.backup_directory)
        }))
    }

    /// Renew the lease of `migration_id` until aborted.
    async fn heartbeat(self, migration_id: String) {
        let period = (self.inner.settings.lease_ttl / 4).max(MIN_HEARTBEAT);
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.inner.history.renew_lease(&migration_id, &self.inner.owner).await {
                Ok(true) => {}
                Ok(false) => warn!("Lease for {} is no longer held by this instance", migration_id),
                Err(e) => warn!("Failed to renew lease for {}: {}", migration_id, e),
            }
        }
    }

    fn active(&self) -> Option<Arc<ActiveRun>> {
        self.inner
            .slot
            .lock()
            .as_ref()
            .filter(|run| !run.is_finished())
            .cloned()
    }

    fn slot_run(&self, migration_id: &str) -> Option<Arc<ActiveRun>> {
        self.inner
            .slot
            .lock()
            .as_ref()
            .filter(|run| run.id == migration_id)
            .cloned()
    }

    /// The run behind a control request, or why it cannot be controlled.
    async fn controllable(&self, migration_id: &str) -> Result<Arc<ActiveRun>> {
        if let Some(run) = self.slot_run(migration_id) {
            if run.is_finished() {
                let status = run.record.lock().status;
                return Err(MigrateError::InvalidState(format!(
                    "migration {} is {:?}",
                    migration_id, status
                )));
            }
            return Ok(run);
        }
        match self.inner.history.get(migration_id).await? {
            Some(run) if run.status.is_terminal() => Err(MigrateError::InvalidState(format!(
                "migration {} is {:?}",
                migration_id, run.status
            ))),
            Some(_) => Err(MigrateError::InvalidState(format!(
                "migration {} is not owned by this instance",
                migration_id
            ))),
            None => Err(MigrateError::NotFound(format!("migration {}", migration_id))),
        }
    }

    /// Best-effort save of a live snapshot.
    async fn persist(&self, run: &ActiveRun) {
        if let Err(e) = self.inner.history.save(&run.snapshot()).await {
            warn!("Failed to save progress of {}: {}", run.id, e);
        }
    }

    /// Run the enabled phases. Never changes the run status.
    async fn drive(self, run: Arc<ActiveRun>, options: MigrationOptions) {
        let ctx = run.ctx.clone();
        let progress = ctx.reporter.progress();
        let phases = 1 + u64::from(options.validate_against_legacy) + u64::from(options.remove_authentication);
        progress.set_phases(phases);

        // Phase 1: Seeding
        info!("Phase 1: Seeding target from {}", self.inner.legacy.name());
        ctx.reporter.set_operation(Phase::Seeding.label());
        progress.start_phase(Phase::Seeding);
        let seeder = BatchSeeder::new(self.inner.legacy.clone(), self.inner.target.clone());
        let tables = match seeder.select_tables(&options).await {
            Ok(tables) => {
                let result = seeder.seed(&tables, &options, &ctx).await;
                run.record.lock().seeding_result = Some(result);
                tables
            }
            Err(e) => {
                ctx.reporter.record(MigrationError::new(
                    ErrorLevel::Fatal,
                    Phase::Seeding,
                    format!("table discovery failed: {}", e),
                ));
                Vec::new()
            }
        };
        progress.finish_phase();
        self.persist(&run).await;

        if ctx.reporter.has_fatal() {
            error!("Seeding failed fatally, skipping remaining phases");
        }

        // Phase 2: Validation
        let mut validation_fatal = false;
        if options.validate_against_legacy && !ctx.control.is_cancelled() && !ctx.reporter.has_fatal() {
            info!("Phase 2: Validating against legacy");
            ctx.reporter.set_operation(Phase::Validation.label());
            progress.start_phase(Phase::Validation);
            validation_fatal = self.validate(&run, &tables, &options).await;
            progress.finish_phase();
            self.persist(&run).await;
        }

        // Phase 3: AuthRemoval
        if options.remove_authentication && !ctx.control.is_cancelled() {
            let seeding_fatal = run
                .record
                .lock()
                .seeding_result
                .as_ref()
                .map_or(true, |r| r.fatal.is_some());
            if seeding_fatal {
                info!("Skipping authentication removal after failed seeding");
            } else if validation_fatal && options.validation_gates_auth_removal {
                ctx.reporter.record(MigrationError::new(
                    ErrorLevel::Warning,
                    Phase::AuthRemoval,
                    "authentication removal skipped: validation failed fatally",
                ));
            } else {
                info!("Phase 3: Removing authentication");
                ctx.reporter.set_operation(Phase::AuthRemoval.label());
                progress.start_phase(Phase::AuthRemoval);
                let planner = AuthRemovalPlanner::new(self.inner.settings.auth_roots.clone());
                match planner.plan_blocking(&options.auth_removal).await {
                    Ok(plan) => {
                        info!("Planned {} auth removal changes", plan.changes.len());
                        let result = planner.execute(&plan, &options.auth_removal, &ctx).await;
                        run.record.lock().auth_removal_result = Some(result);
                    }
                    Err(e) => ctx.reporter.record(MigrationError::new(
                        ErrorLevel::Fatal,
                        Phase::AuthRemoval,
                        format!("planning failed: {}", e),
                    )),
                }
                progress.finish_phase();
            }
        }
    }

    /// Validation phase. Returns whether it ended with a fatal failure.
    async fn validate(&self, run: &ActiveRun, tables: &[Table], options: &MigrationOptions) -> bool {
        let ctx = &run.ctx;
        let fatal = |message: String| {
            ctx.reporter
                .record(MigrationError::new(ErrorLevel::Fatal, Phase::Validation, message));
            true
        };

        let legacy: Arc<dyn LegacySource> = match &options.validation.legacy_connection_string {
            Some(conn_str) => {
                match PgStore::from_connection_string(conn_str, &self.inner.settings.legacy_schema, "legacy-validation")
                    .await
                {
                    Ok(store) => Arc::new(store),
                    Err(e) => return fatal(format!("legacy validation connection failed: {}", e)),
                }
            }
            None => self.inner.legacy.clone(),
        };

        let mut queries: Vec<QueryDefinition> =
            self.inner.settings.queries.iter().map(QueryDefinition::from).collect();
        if options.validation.auto_table_queries {
            let named: HashSet<String> = queries.iter().map(|q| q.name.clone()).collect();
            queries.extend(
                tables
                    .iter()
                    .map(QueryDefinition::table_scan)
                    .filter(|q| !named.contains(&q.name)),
            );
        }
        let queries = match DifferentialValidator::select_queries(queries, options) {
            Ok(queries) => queries,
            Err(e) => return fatal(format!("query selection failed: {}", e)),
        };

        let validator = DifferentialValidator::new(legacy, self.inner.target.clone());
        let result = validator.validate(&queries, options, ctx).await;
        let failed = result.fatal.is_some();
        run.record.lock().validation_result = Some(result);
        failed
    }

    /// Settle the final status, persist the record and free the lease.
    async fn finalize(&self, run: &ActiveRun) {
        let ctx = &run.ctx;
        ctx.reporter.set_operation(Phase::Finalization.label());
        let timeout_secs = run.record.lock().options.operation_timeout_secs;

        let status = if run.timed_out.load(Ordering::SeqCst) {
            ctx.reporter.record(MigrationError::new(
                ErrorLevel::Fatal,
                Phase::Finalization,
                MigrateError::timeout("migration", timeout_secs).to_string(),
            ));
            RunStatus::Failed
        } else if ctx.control.is_cancelled() {
            RunStatus::Cancelled
        } else if ctx.reporter.has_fatal() {
            RunStatus::Failed
        } else {
            ctx.reporter.progress().complete();
            RunStatus::Completed
        };

        let errors = ctx.reporter.errors();
        let statistics = ctx.reporter.progress().snapshot(errors.len() as u64);
        let record = {
            let mut record = run.record.lock();
            record.status = status;
            record.end_time = Some(Utc::now());
            record.current_operation = format!("{:?}", status);
            record.errors = errors;
            record.statistics = statistics;
            record.clone()
        };

        info!(
            "Migration {:?}: {} tables, {} rows, {} errors in {:.1}s",
            status,
            record.statistics.processed_tables,
            record.statistics.processed_rows,
            record.errors.len(),
            record.duration().num_milliseconds() as f64 / 1000.0
        );

        let history = &self.inner.history;
        if let Err(e) = history.save(&record).await {
            error!("Failed to save final record of {}: {}", run.id, e);
        }
        if let Err(e) = history.release_lease(&run.id).await {
            error!("Failed to release lease for {}: {}", run.id, e);
        }
        run.done.send_replace(true);
    }
}
