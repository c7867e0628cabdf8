//! Run records kept in the history store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::auth_removal::AuthRemovalResult;
use crate::config::MigrationOptions;
use crate::seeder::SeedingResult;
use crate::verify::ValidationResult;

/// Overall run status.
///
/// `NotStarted -> InProgress -> {Completed, Failed, Cancelled}`, with
/// `InProgress <-> Paused`. Terminal states accept no transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, Failed or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// InProgress or Paused.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::InProgress | RunStatus::Paused)
    }
}

/// Phase a run is in, or an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Initialization,
    Seeding,
    Validation,
    AuthRemoval,
    Finalization,
}

impl Phase {
    /// Human-readable label used for `currentOperation`.
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Initialization => "Initializing",
            Phase::Seeding => "Seeding data",
            Phase::Validation => "Validating against legacy",
            Phase::AuthRemoval => "Removing authentication",
            Phase::Finalization => "Finalizing",
        }
    }
}

/// Severity of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorLevel {
    Warning,
    Error,
    Fatal,
}

/// An error recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationError {
    pub timestamp: DateTime<Utc>,
    pub level: ErrorLevel,
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl MigrationError {
    pub fn new(level: ErrorLevel, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            phase,
            message: message.into(),
            details: None,
            table: None,
            query: None,
            file: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Table, query or file the error is about, if any.
    pub fn identifier(&self) -> Option<&str> {
        self.table
            .as_deref()
            .or(self.query.as_deref())
            .or(self.file.as_deref())
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatistics {
    pub total_tables: u64,
    pub processed_tables: u64,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub total_queries: u64,
    pub queries_attempted: u64,
    pub total_files: u64,
    pub files_processed: u64,
    pub error_count: u64,
    pub elapsed_ms: u64,
    pub progress_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_secs: Option<u64>,
}

/// A migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRun {
    pub migration_id: String,
    pub status: RunStatus,
    pub options: MigrationOptions,
    pub statistics: MigrationStatistics,
    pub errors: Vec<MigrationError>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub current_operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeding_result: Option<SeedingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_removal_result: Option<AuthRemovalResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,

    /// HMAC-SHA256 over the record with this field unset. Only the file
    /// backend fills it in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl MigrationRun {
    /// Create a run record for freshly submitted options.
    pub fn new(migration_id: impl Into<String>, options: MigrationOptions) -> Self {
        Self {
            migration_id: migration_id.into(),
            status: RunStatus::NotStarted,
            options,
            statistics: MigrationStatistics::default(),
            errors: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            current_operation: Phase::Initialization.label().to_string(),
            seeding_result: None,
            validation_result: None,
            auth_removal_result: None,
            config_hash: None,
            hmac: None,
        }
    }

    /// Wall-clock duration, up to now for unfinished runs.
    pub fn duration(&self) -> Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }

    /// Whether any recorded error is Fatal.
    pub fn has_fatal(&self) -> bool {
        self.errors.iter().any(|e| e.level == ErrorLevel::Fatal)
    }
}

/// Aggregates over finished runs within a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStatistics {
    pub window_days: u32,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub cancelled_runs: u64,
    pub average_duration_secs: f64,
    pub total_rows_processed: u64,
    pub total_tables_processed: u64,
}

impl HistoryStatistics {
    /// Aggregate the terminal runs among `runs`. Active runs are ignored.
    pub fn from_runs(runs: &[MigrationRun], window_days: u32) -> Self {
        let finished: Vec<&MigrationRun> = runs.iter().filter(|r| r.status.is_terminal()).collect();

        let mut stats = HistoryStatistics {
            window_days,
            total_runs: finished.len() as u64,
            ..Default::default()
        };

        let mut duration_total = 0.0;
        let mut timed = 0u64;
        for run in &finished {
            match run.status {
                RunStatus::Completed => stats.successful_runs += 1,
                RunStatus::Failed => stats.failed_runs += 1,
                RunStatus::Cancelled => stats.cancelled_runs += 1,
                _ => {}
            }
            if let Some(end) = run.end_time {
                duration_total += (end - run.start_time).num_milliseconds().max(0) as f64 / 1000.0;
                timed += 1;
            }
            stats.total_rows_processed += run.statistics.processed_rows;
            stats.total_tables_processed += run.statistics.processed_tables;
        }
        if timed > 0 {
            stats.average_duration_secs = duration_total / timed as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(status: RunStatus, secs: i64, rows: u64) -> MigrationRun {
        let mut run = MigrationRun::new(uuid::Uuid::new_v4().to_string(), MigrationOptions::default());
        run.status = status;
        run.end_time = Some(run.start_time + Duration::seconds(secs));
        run.statistics.processed_rows = rows;
        run.statistics.processed_tables = 1;
        run
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Paused.is_active());
        assert!(!RunStatus::NotStarted.is_active());
    }

    #[test]
    fn test_history_statistics() {
        let mut active = MigrationRun::new("active", MigrationOptions::default());
        active.status = RunStatus::InProgress;
        let runs = vec![
            finished(RunStatus::Completed, 10, 100),
            finished(RunStatus::Failed, 20, 5),
            finished(RunStatus::Cancelled, 30, 0),
            active,
        ];
        let stats = HistoryStatistics::from_runs(&runs, 30);
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.successful_runs, 1);
        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.cancelled_runs, 1);
        assert_eq!(stats.total_rows_processed, 105);
        assert_eq!(stats.total_tables_processed, 3);
        assert!((stats.average_duration_secs - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window() {
        let stats = HistoryStatistics::from_runs(&[], 7);
        assert_eq!(stats.total_runs, 0);
        assert_eq!(stats.average_duration_secs, 0.0);
        assert_eq!(stats.window_days, 7);
    }

    #[test]
    fn test_run_serializes_camel_case() {
        let run = MigrationRun::new("abc", MigrationOptions::default());
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["migrationId"], "abc");
        assert_eq!(json["status"], "NotStarted");
        assert!(json.get("seedingResult").is_none());
        assert!(json.get("hmac").is_none());
    }

    #[test]
    fn test_error_identifier() {
        let err = MigrationError::new(ErrorLevel::Error, Phase::Seeding, "boom").with_table("Users");
        assert_eq!(err.identifier(), Some("Users"));
        let err = MigrationError::new(ErrorLevel::Warning, Phase::AuthRemoval, "x").with_file("a.cs");
        assert_eq!(err.identifier(), Some("a.cs"));
    }
}
