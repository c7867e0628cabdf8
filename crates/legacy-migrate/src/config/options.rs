//! Per-run migration options.
//!
//! These are submitted with each start request (API body, CLI options file
//! or the `migration` section of the service config) and frozen into the
//! run record once the run starts. Wire names are camelCase.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level options for one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationOptions {
    /// Delete existing target rows before seeding each table.
    pub clear_existing_data: bool,

    /// Create target tables that do not exist yet.
    pub create_missing_tables: bool,

    /// Run the differential validation phase.
    pub validate_against_legacy: bool,

    /// Run the authentication removal phase.
    pub remove_authentication: bool,

    /// Worker pool size for seeding and validation.
    pub max_concurrent_operations: usize,

    /// Time budget for the whole run, in seconds.
    pub operation_timeout_secs: u64,

    /// Tables to seed (glob patterns, empty = all).
    pub include_tables: Vec<String>,

    /// Tables to skip (glob patterns).
    pub exclude_tables: Vec<String>,

    /// Skip auth removal when validation ends with a fatal error.
    pub validation_gates_auth_removal: bool,

    /// Seeding phase options.
    pub seeding: SeedingOptions,

    /// Validation phase options.
    pub validation: ValidationOptions,

    /// Auth removal phase options.
    pub auth_removal: AuthRemovalOptions,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            clear_existing_data: true,
            create_missing_tables: true,
            validate_against_legacy: true,
            remove_authentication: false,
            max_concurrent_operations: 4,
            operation_timeout_secs: 30 * 60,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            validation_gates_auth_removal: false,
            seeding: SeedingOptions::default(),
            validation: ValidationOptions::default(),
            auth_removal: AuthRemovalOptions::default(),
        }
    }
}

impl MigrationOptions {
    /// Run-wide time budget.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Batch seeding options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedingOptions {
    /// Rows per batch.
    pub batch_size: usize,

    /// Record batch failures and keep going instead of stopping the table.
    pub continue_on_error: bool,

    /// Run the row validator before each insert.
    pub validate_before_insert: bool,

    /// Commit each batch in its own transaction.
    pub use_transactions: bool,

    /// Time budget per batch, in seconds.
    pub command_timeout_secs: u64,

    /// Retries of a batch read or write after a connection failure or
    /// timeout. Other failures are never retried.
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds. Doubles per attempt.
    pub retry_delay_ms: u64,

    /// Upper bound on the retry delay, in milliseconds.
    pub max_retry_delay_ms: u64,
}

impl Default for SeedingOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            continue_on_error: true,
            validate_before_insert: true,
            use_transactions: true,
            command_timeout_secs: 5 * 60,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
        }
    }
}

impl SeedingOptions {
    /// Per-batch time budget.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

/// Differential validation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationOptions {
    /// Diff result sets.
    pub compare_query_results: bool,

    /// Compare execution times.
    pub compare_performance: bool,

    /// Discrepancies retained per query; the rest are only counted.
    pub max_discrepancies_to_report: usize,

    /// Allowed slowdown of the current system, in percent.
    pub performance_threshold_percent: f64,

    /// Time budget per query side, in seconds.
    pub query_timeout_secs: u64,

    /// Alternate legacy endpoint for validation queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_connection_string: Option<String>,

    /// Apply the tolerant comparison policy (see `verify::normalize`).
    pub ignore_minor_differences: bool,

    /// Lowest match percentage that still counts as success.
    pub min_match_percentage: f64,

    /// Total discrepancies tolerated before validation fails.
    pub discrepancy_tolerance: usize,

    /// Query names to run (glob patterns, empty = all).
    pub include_queries: Vec<String>,

    /// Query names to skip (glob patterns).
    pub exclude_queries: Vec<String>,

    /// Add a full-table comparison for every seeded table.
    pub auto_table_queries: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            compare_query_results: true,
            compare_performance: true,
            max_discrepancies_to_report: 100,
            performance_threshold_percent: 20.0,
            query_timeout_secs: 2 * 60,
            legacy_connection_string: None,
            ignore_minor_differences: true,
            min_match_percentage: 100.0,
            discrepancy_tolerance: 0,
            include_queries: Vec::new(),
            exclude_queries: Vec::new(),
            auto_table_queries: true,
        }
    }
}

impl ValidationOptions {
    /// Per-query time budget.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Authentication removal options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthRemovalOptions {
    /// Back up every file before it is modified.
    pub create_backup: bool,

    /// Directory that receives backup sets.
    pub backup_directory: String,

    /// Strip authentication from the API project.
    pub remove_from_api: bool,

    /// Strip guards and interceptors from the frontend project.
    pub remove_from_frontend: bool,

    /// Write a removal notes file after all changes.
    pub update_documentation: bool,

    /// Files never touched (glob patterns, relative to the scanned root).
    pub files_to_exclude: Vec<String>,
}

impl Default for AuthRemovalOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            backup_directory: "auth-backup".to_string(),
            remove_from_api: true,
            remove_from_frontend: true,
            update_documentation: true,
            files_to_exclude: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let o = MigrationOptions::default();
        assert!(o.clear_existing_data);
        assert!(!o.remove_authentication);
        assert_eq!(o.max_concurrent_operations, 4);
        assert_eq!(o.operation_timeout(), Duration::from_secs(1800));
        assert_eq!(o.seeding.batch_size, 1000);
        assert_eq!(o.validation.max_discrepancies_to_report, 100);
        assert_eq!(o.auth_removal.backup_directory, "auth-backup");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let o: MigrationOptions = serde_json::from_str(
            r#"{"removeAuthentication": true, "seeding": {"batchSize": 50}}"#,
        )
        .unwrap();
        assert!(o.remove_authentication);
        assert_eq!(o.seeding.batch_size, 50);
        assert!(o.seeding.use_transactions);
        assert_eq!(o.validation.query_timeout_secs, 120);
    }

    #[test]
    fn test_retry_delay_doubles_up_to_cap() {
        let seeding = SeedingOptions {
            retry_delay_ms: 500,
            max_retry_delay_ms: 3000,
            ..SeedingOptions::default()
        };
        assert_eq!(seeding.retry_delay(1), Duration::from_millis(500));
        assert_eq!(seeding.retry_delay(2), Duration::from_millis(1000));
        assert_eq!(seeding.retry_delay(3), Duration::from_millis(2000));
        assert_eq!(seeding.retry_delay(4), Duration::from_millis(3000));
        assert_eq!(seeding.retry_delay(80), Duration::from_millis(3000));
    }
}
