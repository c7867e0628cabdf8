//! Differential validation of the new schema against the legacy system.
//!
//! Each [`QueryDefinition`] is executed on the legacy source and then on
//! the current store, each side bounded by `queryTimeout`. Successful
//! pairs are diffed row by row (by key columns when given, positionally
//! otherwise) and their timings compared. A failed query never counts as
//! a discrepancy; it is reported and the phase moves on, unless the
//! failure was a lost connection, which stops the phase.

mod diff;
pub mod normalize;
pub mod types;

pub use diff::{diff_results, DiffReport};
pub use types::{
    performance_ratio, Discrepancy, DiscrepancyKind, QueryComparisonResult, QueryDefinition, QueryOutcome,
    ValidationResult, ValidationSummary,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, Instrument};

use crate::config::{MigrationOptions, NameFilter};
use crate::core::{LegacySource, QueryResult, TargetStore};
use crate::error::{MigrateError, Result};
use crate::history::{ErrorLevel, MigrationError, Phase};
use crate::orchestrator::RunContext;

/// Runs paired queries against the legacy and current stores.
#[derive(Clone)]
pub struct DifferentialValidator {
    legacy: Arc<dyn LegacySource>,
    current: Arc<dyn TargetStore>,
}

impl DifferentialValidator {
    pub fn new(legacy: Arc<dyn LegacySource>, current: Arc<dyn TargetStore>) -> Self {
        Self { legacy, current }
    }

    /// Queries selected by the include/exclude patterns, order preserved.
    pub fn select_queries(
        queries: Vec<QueryDefinition>,
        options: &MigrationOptions,
    ) -> Result<Vec<QueryDefinition>> {
        let v = &options.validation;
        let filter = NameFilter::new(&v.include_queries, &v.exclude_queries)?;
        Ok(queries.into_iter().filter(|q| filter.matches(&q.name)).collect())
    }

    /// Compare every query, returning results in submission order.
    pub async fn validate(
        &self,
        queries: &[QueryDefinition],
        options: &MigrationOptions,
        ctx: &RunContext,
    ) -> ValidationResult {
        let started = Instant::now();
        let workers = options.max_concurrent_operations.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let halt = Arc::new(AtomicBool::new(false));
        let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        ctx.reporter.progress().add_queries(queries.len() as u64);
        info!(
            "Validating {} queries against {} with {} workers",
            queries.len(),
            self.legacy.name(),
            workers
        );

        let mut results: Vec<Option<QueryComparisonResult>> = vec![None; queries.len()];
        let mut handles = Vec::new();

        for (index, query) in queries.iter().enumerate() {
            if halt.load(Ordering::SeqCst) || !ctx.control.checkpoint().await {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            if halt.load(Ordering::SeqCst) || ctx.control.is_cancelled() {
                break;
            }

            let validator = self.clone();
            let name = query.name.clone();
            let query = query.clone();
            let options = options.clone();
            let ctx = ctx.clone();
            let halt = halt.clone();
            let fatal = fatal.clone();

            let handle = tokio::spawn(
                async move {
                    let result = validator.compare_query(&query, &options).await;
                    validator.report(&result, &options, &ctx);
                    if result.is_fatal() {
                        halt.store(true, Ordering::SeqCst);
                        if let QueryOutcome::Failed { message, .. } = &result.outcome {
                            fatal.lock().get_or_insert_with(|| format!("{}: {}", result.query_name, message));
                        }
                    }
                    ctx.reporter.progress().query_done();
                    drop(permit);
                    result
                }
                .in_current_span(),
            );
            handles.push((index, name, handle));
        }

        for (index, name, handle) in handles {
            match handle.await {
                Ok(result) => results[index] = Some(result),
                Err(e) => {
                    error!("{}: task panicked - {}", name, e);
                    ctx.reporter.record(
                        MigrationError::new(ErrorLevel::Error, Phase::Validation, format!("Task panicked: {}", e))
                            .with_query(&name),
                    );
                    results[index] = Some(QueryComparisonResult::failed(
                        &name,
                        queries[index].critical,
                        false,
                        format!("task panicked: {}", e),
                    ));
                }
            }
        }

        // Queries never dispatched (cancel or fatal stop) are left out.
        let query_results: Vec<QueryComparisonResult> = results.into_iter().flatten().collect();
        let summary = ValidationSummary::from_results(&query_results);
        let fatal = fatal.lock().take();

        if let Some(message) = &fatal {
            ctx.reporter.record(MigrationError::new(
                ErrorLevel::Fatal,
                Phase::Validation,
                format!("validation stopped: {}", message),
            ));
        }

        let v = &options.validation;
        let success = fatal.is_none()
            && summary.match_percentage >= v.min_match_percentage
            && summary.total_discrepancies <= v.discrepancy_tolerance as u64;

        info!(
            "Validation: {}/{} matched ({:.1}%), {} discrepancies, {} failed",
            summary.queries_matched,
            summary.queries_attempted,
            summary.match_percentage,
            summary.total_discrepancies,
            summary.queries_failed
        );

        ValidationResult {
            query_results,
            summary,
            success,
            fatal,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn compare_query(&self, query: &QueryDefinition, options: &MigrationOptions) -> QueryComparisonResult {
        let v = &options.validation;
        let timeout = v.query_timeout();

        let legacy = timed(&query.name, v.query_timeout_secs, timeout, self.legacy.execute_query(&query.legacy)).await;
        let (legacy_rows, legacy_ms) = match legacy {
            Ok(r) => r,
            Err(e) => return failed(query, "legacy", e),
        };
        let current =
            timed(&query.name, v.query_timeout_secs, timeout, self.current.execute_query(&query.current)).await;
        let (current_rows, current_ms) = match current {
            Ok(r) => r,
            Err(e) => return failed(query, "current", e),
        };

        let diff = if v.compare_query_results {
            diff_results(
                &legacy_rows,
                &current_rows,
                &query.key_columns,
                v.ignore_minor_differences,
                v.max_discrepancies_to_report,
            )
        } else {
            DiffReport::default()
        };

        let (ratio, degenerate) = performance_ratio(legacy_ms, current_ms);
        let regression = v.compare_performance
            && !degenerate
            && ratio > 1.0 + v.performance_threshold_percent / 100.0;

        debug!(
            "{}: legacy {} rows in {:.1}ms, current {} rows in {:.1}ms, {} discrepancies",
            query.name,
            legacy_rows.rows.len(),
            legacy_ms,
            current_rows.rows.len(),
            current_ms,
            diff.total
        );

        QueryComparisonResult {
            query_name: query.name.clone(),
            legacy_execution_ms: legacy_ms,
            current_execution_ms: current_ms,
            legacy_row_count: legacy_rows.rows.len() as u64,
            current_row_count: current_rows.rows.len() as u64,
            outcome: if diff.total == 0 {
                QueryOutcome::Matched
            } else {
                QueryOutcome::Mismatched
            },
            discrepancies: diff.discrepancies,
            total_discrepancies: diff.total,
            performance_ratio: ratio,
            degenerate_timing: degenerate,
            performance_regression: regression,
            critical: query.critical,
        }
    }

    fn report(&self, result: &QueryComparisonResult, options: &MigrationOptions, ctx: &RunContext) {
        let record = |level: ErrorLevel, message: String| {
            ctx.reporter
                .record(MigrationError::new(level, Phase::Validation, message).with_query(&result.query_name));
        };
        match &result.outcome {
            QueryOutcome::Matched => {}
            QueryOutcome::Mismatched => record(
                ErrorLevel::Warning,
                format!("{} discrepancies between legacy and current results", result.total_discrepancies),
            ),
            QueryOutcome::Failed { fatal, message } => {
                let level = if *fatal { ErrorLevel::Fatal } else { ErrorLevel::Error };
                record(level, message.clone());
            }
        }
        if result.performance_regression {
            record(
                ErrorLevel::Warning,
                format!(
                    "performance regression: current took {:.1}ms vs legacy {:.1}ms (ratio {:.2}, threshold {}%)",
                    result.current_execution_ms,
                    result.legacy_execution_ms,
                    result.performance_ratio,
                    options.validation.performance_threshold_percent
                ),
            );
        }
    }
}

/// Execute one side under the query timeout, returning rows and elapsed ms.
async fn timed<F>(name: &str, seconds: u64, timeout: Duration, fut: F) -> Result<(QueryResult, f64)>
where
    F: std::future::Future<Output = Result<QueryResult>>,
{
    let started = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map(|rows| (rows, started.elapsed().as_secs_f64() * 1000.0)),
        Err(_) => Err(MigrateError::timeout(format!("query {}", name), seconds)),
    }
}

fn failed(query: &QueryDefinition, side: &str, e: MigrateError) -> QueryComparisonResult {
    let fatal = e.is_connection_failure();
    QueryComparisonResult::failed(&query.name, query.critical, fatal, format!("{} side failed: {}", side, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, ColumnType, DataQuery, SqlValue, Table};
    use crate::drivers::MemoryStore;

    fn users(names: &[&str]) -> (Table, Vec<Vec<SqlValue>>) {
        let table = Table::new(
            "Users",
            vec![
                Column::new("id", ColumnType::Int).not_null(),
                Column::new("name", ColumnType::Text),
            ],
        )
        .with_primary_key(&["id"]);
        let rows = names
            .iter()
            .enumerate()
            .map(|(i, n)| vec![SqlValue::Int(i as i64 + 1), SqlValue::from(*n)])
            .collect();
        (table, rows)
    }

    fn stores(legacy: &[&str], current: &[&str]) -> (Arc<MemoryStore>, Arc<MemoryStore>, Table) {
        let l = Arc::new(MemoryStore::new("legacy"));
        let c = Arc::new(MemoryStore::new("current"));
        let (table, rows) = users(legacy);
        l.insert_table(table.clone(), rows);
        let (_, rows) = users(current);
        c.insert_table(table.clone(), rows);
        (l, c, table)
    }

    #[tokio::test]
    async fn test_matching_tables() {
        let (l, c, table) = stores(&["ann", "bob"], &["ann", "bob"]);
        let validator = DifferentialValidator::new(l, c);
        let result = validator
            .validate(&[QueryDefinition::table_scan(&table)], &MigrationOptions::default(), &RunContext::detached())
            .await;
        assert!(result.success);
        assert_eq!(result.summary.match_percentage, 100.0);
        assert!(result.query_results[0].is_matched());
    }

    #[tokio::test]
    async fn test_value_mismatch_is_warning() {
        let (l, c, table) = stores(&["ann", "bob"], &["ann", "rob"]);
        let ctx = RunContext::detached();
        let validator = DifferentialValidator::new(l, c);
        let result = validator
            .validate(&[QueryDefinition::table_scan(&table)], &MigrationOptions::default(), &ctx)
            .await;
        assert!(!result.success);
        let q = &result.query_results[0];
        assert_eq!(q.outcome, QueryOutcome::Mismatched);
        assert_eq!(q.discrepancies[0].row_identifier, "id=2");
        assert_eq!(q.discrepancies[0].kind, DiscrepancyKind::ValueMismatch);
        let errors = ctx.reporter.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].level, ErrorLevel::Warning);
        assert!(!ctx.reporter.has_fatal());
    }

    #[tokio::test]
    async fn test_timeout_is_failed_query_not_discrepancy() {
        let l = Arc::new(MemoryStore::new("legacy").with_latency(Duration::from_millis(1500)));
        let c = Arc::new(MemoryStore::new("current"));
        let (table, rows) = users(&["ann"]);
        l.insert_table(table.clone(), rows.clone());
        c.insert_table(table.clone(), rows);

        let mut options = MigrationOptions::default();
        options.validation.query_timeout_secs = 1;
        let validator = DifferentialValidator::new(l, c);
        let result = validator
            .validate(&[QueryDefinition::table_scan(&table)], &options, &RunContext::detached())
            .await;

        let q = &result.query_results[0];
        assert!(q.is_failed());
        assert!(!q.is_fatal());
        assert_eq!(q.total_discrepancies, 0);
        assert_eq!(result.summary.queries_failed, 1);
        assert!(result.fatal.is_none());
    }

    #[tokio::test]
    async fn test_lost_connection_is_fatal() {
        let (l, c, table) = stores(&["ann"], &["ann"]);
        c.set_offline(true);
        let mut options = MigrationOptions::default();
        options.max_concurrent_operations = 1;
        let ctx = RunContext::detached();
        let queries = vec![QueryDefinition::table_scan(&table), QueryDefinition::table_scan(&table)];

        let validator = DifferentialValidator::new(l, c);
        let result = validator.validate(&queries, &options, &ctx).await;

        assert!(result.query_results[0].is_fatal());
        assert!(result.fatal.is_some());
        assert!(!result.success);
        assert!(ctx.reporter.has_fatal());
    }

    #[tokio::test]
    async fn test_sql_query_error_keeps_going() {
        let (l, c, table) = stores(&["ann"], &["ann"]);
        l.fail_query("SELECT broken", "syntax error");
        let queries = vec![
            QueryDefinition {
                name: "broken".into(),
                legacy: DataQuery::Sql("SELECT broken".into()),
                current: DataQuery::Sql("SELECT broken".into()),
                key_columns: Vec::new(),
                critical: true,
            },
            QueryDefinition::table_scan(&table),
        ];
        let validator = DifferentialValidator::new(l, c);
        let result = validator
            .validate(&queries, &MigrationOptions::default(), &RunContext::detached())
            .await;

        assert_eq!(result.query_results.len(), 2);
        assert!(result.query_results[0].is_failed());
        assert!(result.query_results[1].is_matched());
        assert!(result.summary.critical_issues[0].starts_with("[critical] broken"));
        assert_eq!(result.summary.match_percentage, 50.0);
    }

    #[tokio::test]
    async fn test_tolerance_and_threshold() {
        let (l, c, table) = stores(&["ann", "bob"], &["ann", "rob"]);
        let mut options = MigrationOptions::default();
        options.validation.discrepancy_tolerance = 1;
        options.validation.min_match_percentage = 0.0;
        let validator = DifferentialValidator::new(l, c);
        let result = validator
            .validate(&[QueryDefinition::table_scan(&table)], &options, &RunContext::detached())
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let (l, c, table) = stores(&["ann"], &["ann"]);
        let ctx = RunContext::detached();
        ctx.control.cancel();
        let validator = DifferentialValidator::new(l, c);
        let result = validator
            .validate(&[QueryDefinition::table_scan(&table)], &MigrationOptions::default(), &ctx)
            .await;
        assert!(result.query_results.is_empty());
    }

    #[test]
    fn test_select_queries_filters_by_name() {
        let (table, _) = users(&[]);
        let mut other = table.clone();
        other.name = "AuditLog".into();
        let mut options = MigrationOptions::default();
        options.validation.exclude_queries = vec!["table:audit*".into()];
        let selected = DifferentialValidator::select_queries(
            vec![QueryDefinition::table_scan(&table), QueryDefinition::table_scan(&other)],
            &options,
        )
        .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "table:Users");
    }
}
