//! Lock-free progress counters for the active run.
//!
//! Each enabled phase owns an equal share of the overall percentage; within
//! a phase the share fills by rows (seeding), queries (validation) or files
//! (auth removal). The published percentage is kept in basis points and
//! only ever raised with `fetch_max`, so pollers never see it go backwards
//! even when a phase discovers more work than it first announced.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::history::{MigrationStatistics, Phase, RunStatus};

const FULL: u64 = 10_000;

/// Shared counters for one run.
pub struct ProgressTracker {
    started: Instant,
    phases_enabled: AtomicU64,
    phases_done: AtomicU64,
    current: AtomicU8,
    total_tables: AtomicU64,
    processed_tables: AtomicU64,
    total_rows: AtomicU64,
    processed_rows: AtomicU64,
    total_queries: AtomicU64,
    queries_attempted: AtomicU64,
    total_files: AtomicU64,
    files_processed: AtomicU64,
    basis_points: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            phases_enabled: AtomicU64::new(0),
            phases_done: AtomicU64::new(0),
            current: AtomicU8::new(0),
            total_tables: AtomicU64::new(0),
            processed_tables: AtomicU64::new(0),
            total_rows: AtomicU64::new(0),
            processed_rows: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            queries_attempted: AtomicU64::new(0),
            total_files: AtomicU64::new(0),
            files_processed: AtomicU64::new(0),
            basis_points: AtomicU64::new(0),
        }
    }

    /// Number of phases this run will execute.
    pub fn set_phases(&self, phases: u64) {
        self.phases_enabled.store(phases, Ordering::SeqCst);
    }

    pub fn start_phase(&self, phase: Phase) {
        let code = match phase {
            Phase::Seeding => 1,
            Phase::Validation => 2,
            Phase::AuthRemoval => 3,
            _ => 0,
        };
        self.current.store(code, Ordering::SeqCst);
    }

    pub fn finish_phase(&self) {
        self.phases_done.fetch_add(1, Ordering::SeqCst);
        self.current.store(0, Ordering::SeqCst);
        self.refresh();
    }

    pub fn add_tables(&self, tables: u64, rows: u64) {
        self.total_tables.fetch_add(tables, Ordering::SeqCst);
        self.total_rows.fetch_add(rows, Ordering::SeqCst);
    }

    pub fn rows_done(&self, rows: u64) {
        self.processed_rows.fetch_add(rows, Ordering::SeqCst);
        self.refresh();
    }

    pub fn table_done(&self) {
        self.processed_tables.fetch_add(1, Ordering::SeqCst);
        self.refresh();
    }

    pub fn add_queries(&self, queries: u64) {
        self.total_queries.fetch_add(queries, Ordering::SeqCst);
    }

    pub fn query_done(&self) {
        self.queries_attempted.fetch_add(1, Ordering::SeqCst);
        self.refresh();
    }

    pub fn add_files(&self, files: u64) {
        self.total_files.fetch_add(files, Ordering::SeqCst);
    }

    pub fn file_done(&self) {
        self.files_processed.fetch_add(1, Ordering::SeqCst);
        self.refresh();
    }

    /// Mark the run fully done.
    pub fn complete(&self) {
        self.basis_points.fetch_max(FULL, Ordering::SeqCst);
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    fn ratio(done: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            (done as f64 / total as f64).min(1.0)
        }
    }

    fn current_fraction(&self) -> f64 {
        match self.current.load(Ordering::SeqCst) {
            1 => {
                let rows = Self::load(&self.total_rows);
                if rows > 0 {
                    Self::ratio(Self::load(&self.processed_rows), rows)
                } else {
                    Self::ratio(
                        Self::load(&self.processed_tables),
                        Self::load(&self.total_tables),
                    )
                }
            }
            2 => Self::ratio(
                Self::load(&self.queries_attempted),
                Self::load(&self.total_queries),
            ),
            3 => Self::ratio(
                Self::load(&self.files_processed),
                Self::load(&self.total_files),
            ),
            _ => 0.0,
        }
    }

    /// Recompute the overall percentage and raise the published value.
    pub fn refresh(&self) -> f64 {
        let enabled = Self::load(&self.phases_enabled);
        if enabled > 0 {
            let done = Self::load(&self.phases_done).min(enabled) as f64;
            let overall = (done + self.current_fraction()) / enabled as f64;
            // Only `complete` may publish 100%.
            let candidate = ((overall * FULL as f64) as u64).min(FULL - 1);
            self.basis_points.fetch_max(candidate, Ordering::SeqCst);
        }
        self.percentage()
    }

    pub fn percentage(&self) -> f64 {
        Self::load(&self.basis_points) as f64 / 100.0
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Remaining time extrapolated from elapsed time and progress so far.
    /// None until some progress is measurable.
    pub fn eta_secs(&self) -> Option<u64> {
        let bp = Self::load(&self.basis_points);
        if bp == 0 {
            return None;
        }
        if bp >= FULL {
            return Some(0);
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        Some((elapsed * (FULL - bp) as f64 / bp as f64).round() as u64)
    }

    /// Consistent statistics snapshot.
    pub fn snapshot(&self, error_count: u64) -> MigrationStatistics {
        let progress_percentage = self.refresh();
        MigrationStatistics {
            total_tables: Self::load(&self.total_tables),
            processed_tables: Self::load(&self.processed_tables),
            total_rows: Self::load(&self.total_rows),
            processed_rows: Self::load(&self.processed_rows),
            total_queries: Self::load(&self.total_queries),
            queries_attempted: Self::load(&self.queries_attempted),
            total_files: Self::load(&self.total_files),
            files_processed: Self::load(&self.files_processed),
            error_count,
            elapsed_ms: self.elapsed_ms(),
            progress_percentage,
            estimated_time_remaining_secs: self.eta_secs(),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// What a polling client sees for the active run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub migration_id: String,
    pub status: RunStatus,
    pub current_operation: String,
    pub progress_percentage: f64,
    pub processed_tables: u64,
    pub total_tables: u64,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub queries_attempted: u64,
    pub total_queries: u64,
    pub files_processed: u64,
    pub error_count: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_secs: Option<u64>,
}

impl ProgressView {
    pub fn new(
        migration_id: &str,
        status: RunStatus,
        current_operation: String,
        stats: &MigrationStatistics,
    ) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            status,
            current_operation,
            progress_percentage: stats.progress_percentage,
            processed_tables: stats.processed_tables,
            total_tables: stats.total_tables,
            processed_rows: stats.processed_rows,
            total_rows: stats.total_rows,
            queries_attempted: stats.queries_attempted,
            total_queries: stats.total_queries,
            files_processed: stats.files_processed,
            error_count: stats.error_count,
            elapsed_ms: stats.elapsed_ms,
            estimated_time_remaining_secs: stats.estimated_time_remaining_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_eta_before_progress() {
        let tracker = ProgressTracker::new();
        tracker.set_phases(1);
        tracker.start_phase(Phase::Seeding);
        assert_eq!(tracker.refresh(), 0.0);
        assert!(tracker.eta_secs().is_none());
    }

    #[test]
    fn test_progress_is_monotonic_when_work_grows() {
        let tracker = ProgressTracker::new();
        tracker.set_phases(1);
        tracker.start_phase(Phase::Seeding);
        tracker.add_tables(1, 100);
        tracker.rows_done(50);
        let first = tracker.percentage();
        assert!((first - 50.0).abs() < 0.01);

        // More work discovered: the raw ratio drops to 25%.
        tracker.add_tables(1, 100);
        tracker.refresh();
        assert_eq!(tracker.percentage(), first);

        tracker.rows_done(100);
        assert!(tracker.percentage() > first);
    }

    #[test]
    fn test_phases_share_progress() {
        let tracker = ProgressTracker::new();
        tracker.set_phases(2);
        tracker.start_phase(Phase::Seeding);
        tracker.add_tables(1, 10);
        tracker.rows_done(10);
        tracker.finish_phase();
        assert!((tracker.percentage() - 50.0).abs() < 0.01);

        tracker.start_phase(Phase::Validation);
        tracker.add_queries(4);
        tracker.query_done();
        assert!((tracker.percentage() - 62.5).abs() < 0.01);

        tracker.query_done();
        tracker.query_done();
        tracker.query_done();
        tracker.finish_phase();
        // Full only once the run is marked complete.
        assert!(tracker.percentage() < 100.0);
        tracker.complete();
        assert_eq!(tracker.percentage(), 100.0);
        assert_eq!(tracker.eta_secs(), Some(0));
    }

    #[test]
    fn test_snapshot_counts() {
        let tracker = ProgressTracker::new();
        tracker.set_phases(1);
        tracker.start_phase(Phase::AuthRemoval);
        tracker.add_files(2);
        tracker.file_done();
        let stats = tracker.snapshot(3);
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.error_count, 3);
        assert!(stats.estimated_time_remaining_secs.is_some());
    }
}
