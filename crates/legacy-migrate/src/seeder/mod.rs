//! Batch seeding of the target schema from the legacy source.
//!
//! Tables are processed in parallel up to `maxConcurrentOperations`. Each
//! table is read in batches of `batchSize`; every batch is optionally
//! validated, then written (optionally in its own transaction) under
//! `commandTimeout`. A failed batch only ever affects itself: batches that
//! already committed stay committed.

mod validator;

pub use validator::{RowValidator, RowViolation, SchemaRowValidator};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{MigrationOptions, NameFilter, SeedingOptions};
use crate::core::{LegacySource, Row, Table, TargetStore};
use crate::error::{MigrateError, Result};
use crate::history::{ErrorLevel, MigrationError, Phase};
use crate::orchestrator::RunContext;

/// Final state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableSeedStatus {
    /// Every row read was inserted.
    Completed,
    /// Some rows were inserted, some were skipped or failed.
    PartiallySeeded,
    /// Nothing was inserted because of errors.
    Failed,
    /// Stopped or never started because the run was cancelled.
    Cancelled,
    /// Never started because an earlier table stopped the phase.
    Skipped,
}

/// One failed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchError {
    pub batch_index: u64,
    pub offset: u64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSeedingResult {
    pub table_name: String,
    pub rows_attempted: u64,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub batch_errors: Vec<BatchError>,
    pub elapsed_ms: u64,
    pub table_created: bool,
    pub cleared: bool,
    pub status: TableSeedStatus,
}

impl TableSeedingResult {
    fn new(table_name: &str, status: TableSeedStatus) -> Self {
        Self {
            table_name: table_name.to_string(),
            rows_attempted: 0,
            rows_inserted: 0,
            rows_skipped: 0,
            batch_errors: Vec::new(),
            elapsed_ms: 0,
            table_created: false,
            cleared: false,
            status,
        }
    }
}

/// Outcome of the seeding phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedingResult {
    /// Per-table results, in the order tables were submitted.
    pub table_results: Vec<TableSeedingResult>,
    pub total_rows_inserted: u64,
    pub total_rows_skipped: u64,
    pub tables_completed: u64,
    pub tables_failed: u64,
    pub elapsed_ms: u64,
    pub success: bool,

    /// Set when the phase stopped early because `continueOnError` is off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
}

impl SeedingResult {
    fn from_tables(table_results: Vec<TableSeedingResult>, elapsed_ms: u64, fatal: Option<String>) -> Self {
        let count = |s: TableSeedStatus| table_results.iter().filter(|t| t.status == s).count() as u64;
        let tables_completed = count(TableSeedStatus::Completed);
        let tables_failed = count(TableSeedStatus::Failed) + count(TableSeedStatus::PartiallySeeded);
        let success = fatal.is_none()
            && table_results
                .iter()
                .all(|t| t.status == TableSeedStatus::Completed);

        Self {
            total_rows_inserted: table_results.iter().map(|t| t.rows_inserted).sum(),
            total_rows_skipped: table_results.iter().map(|t| t.rows_skipped).sum(),
            tables_completed,
            tables_failed,
            elapsed_ms,
            success,
            fatal,
            table_results,
        }
    }
}

/// Seeds target tables from the legacy source.
#[derive(Clone)]
pub struct BatchSeeder {
    source: Arc<dyn LegacySource>,
    target: Arc<dyn TargetStore>,
    validator: Arc<dyn RowValidator>,
}

impl BatchSeeder {
    pub fn new(source: Arc<dyn LegacySource>, target: Arc<dyn TargetStore>) -> Self {
        Self {
            source,
            target,
            validator: Arc::new(SchemaRowValidator),
        }
    }

    /// Replace the default schema validator.
    pub fn with_validator(mut self, validator: Arc<dyn RowValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Legacy tables selected by the include/exclude patterns, in name order.
    pub async fn select_tables(&self, options: &MigrationOptions) -> Result<Vec<Table>> {
        let filter = NameFilter::new(&options.include_tables, &options.exclude_tables)?;
        let mut tables: Vec<Table> = self
            .source
            .list_tables()
            .await?
            .into_iter()
            .filter(|t| filter.matches(&t.name))
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tables)
    }

    /// Seed `tables`, returning one result per table in submission order.
    pub async fn seed(&self, tables: &[Table], options: &MigrationOptions, ctx: &RunContext) -> SeedingResult {
        let started = Instant::now();
        let workers = options.max_concurrent_operations.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let halt = Arc::new(AtomicBool::new(false));
        let progress = ctx.reporter.progress();

        progress.add_tables(
            tables.len() as u64,
            tables.iter().map(|t| t.row_count).sum(),
        );
        info!("Seeding {} tables with {} workers", tables.len(), workers);

        let mut results: Vec<Option<TableSeedingResult>> = vec![None; tables.len()];
        let mut handles = Vec::new();

        for (index, table) in tables.iter().enumerate() {
            if halt.load(Ordering::SeqCst) {
                results[index] = Some(TableSeedingResult::new(&table.name, TableSeedStatus::Skipped));
                continue;
            }
            if !ctx.control.checkpoint().await {
                results[index] = Some(TableSeedingResult::new(&table.name, TableSeedStatus::Cancelled));
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            // The wait for a worker can outlast a cancel or a sibling's failure.
            if ctx.control.is_cancelled() || halt.load(Ordering::SeqCst) {
                let status = if ctx.control.is_cancelled() {
                    TableSeedStatus::Cancelled
                } else {
                    TableSeedStatus::Skipped
                };
                results[index] = Some(TableSeedingResult::new(&table.name, status));
                continue;
            }

            let seeder = self.clone();
            let table = table.clone();
            let options = options.clone();
            let ctx = ctx.clone();
            let halt = halt.clone();
            let name = table.name.clone();

            let handle = tokio::spawn(
                async move {
                    let result = seeder.seed_table(&table, &options, &ctx, &halt).await;
                    drop(permit);
                    result
                }
                .in_current_span(),
            );
            handles.push((index, name, handle));
        }

        for (index, name, handle) in handles {
            let result = match handle.await {
                Ok(result) => {
                    info!(
                        "{}: {:?} ({} inserted, {} skipped)",
                        name, result.status, result.rows_inserted, result.rows_skipped
                    );
                    result
                }
                Err(e) => {
                    error!("{}: task panicked - {}", name, e);
                    ctx.reporter.record(
                        MigrationError::new(ErrorLevel::Error, Phase::Seeding, format!("Task panicked: {}", e))
                            .with_table(&name),
                    );
                    TableSeedingResult::new(&name, TableSeedStatus::Failed)
                }
            };
            results[index] = Some(result);
        }

        let table_results: Vec<TableSeedingResult> = results
            .into_iter()
            .zip(tables)
            .map(|(r, t)| r.unwrap_or_else(|| TableSeedingResult::new(&t.name, TableSeedStatus::Cancelled)))
            .collect();

        let fatal = halt.load(Ordering::SeqCst).then(|| {
            let failed: Vec<&str> = table_results
                .iter()
                .filter(|t| matches!(t.status, TableSeedStatus::Failed | TableSeedStatus::PartiallySeeded))
                .map(|t| t.table_name.as_str())
                .collect();
            format!(
                "seeding stopped after failure in {} (continueOnError is off)",
                failed.join(", ")
            )
        });
        if let Some(message) = &fatal {
            ctx.reporter
                .record(MigrationError::new(ErrorLevel::Fatal, Phase::Seeding, message.clone()));
        }

        SeedingResult::from_tables(table_results, started.elapsed().as_millis() as u64, fatal)
    }

    async fn seed_table(
        &self,
        table: &Table,
        options: &MigrationOptions,
        ctx: &RunContext,
        halt: &AtomicBool,
    ) -> TableSeedingResult {
        let started = Instant::now();
        let seeding = &options.seeding;
        let mut result = TableSeedingResult::new(&table.name, TableSeedStatus::Completed);

        let report = |message: String| {
            ctx.reporter.record(
                MigrationError::new(ErrorLevel::Error, Phase::Seeding, message).with_table(&table.name),
            );
        };

        let prepared = with_retry(
            &format!("prepare of {}", table.name),
            seeding,
            ctx,
            MigrateError::is_connection_failure,
            move || self.prepare_table(table, options),
        )
        .await;
        match prepared {
            Ok(p) => {
                result.table_created = p.created;
                result.cleared = p.cleared;
            }
            Err(e) => {
                report(e.to_string());
                result.batch_errors.push(BatchError {
                    batch_index: 0,
                    offset: 0,
                    message: e.to_string(),
                    timestamp: Utc::now(),
                });
                result.status = TableSeedStatus::Failed;
                if !seeding.continue_on_error {
                    halt.store(true, Ordering::SeqCst);
                }
                ctx.reporter.progress().table_done();
                result.elapsed_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        }

        info!("{}: seeding ({} rows)", table.name, table.row_count);

        let timeout = seeding.command_timeout();
        let mut offset = 0u64;
        let mut batch_index = 0u64;
        let mut stopped = false;
        let mut cancelled = false;

        loop {
            if !ctx.control.checkpoint().await {
                cancelled = true;
                break;
            }

            let read = with_retry(
                &format!("read of {} at offset {}", table.name, offset),
                seeding,
                ctx,
                is_transient,
                move || async move {
                    let rows = self.source.read_batch(table, offset, seeding.batch_size);
                    match tokio::time::timeout(timeout, rows).await {
                        Ok(rows) => rows,
                        Err(_) => Err(MigrateError::timeout(
                            format!("read of batch {}", batch_index),
                            seeding.command_timeout_secs,
                        )),
                    }
                },
            )
            .await;

            let rows = match read {
                Ok(rows) => rows,
                Err(e) => {
                    let message = format!("read at offset {} failed: {}", offset, e);
                    report(message.clone());
                    result.batch_errors.push(BatchError {
                        batch_index,
                        offset,
                        message,
                        timestamp: Utc::now(),
                    });
                    if !seeding.continue_on_error {
                        stopped = true;
                        break;
                    }
                    // Skip the unreadable batch; the row count bounds the scan.
                    let remaining = table.row_count.saturating_sub(offset);
                    ctx.reporter
                        .progress()
                        .rows_done(remaining.min(seeding.batch_size as u64));
                    offset += seeding.batch_size as u64;
                    batch_index += 1;
                    if offset >= table.row_count {
                        break;
                    }
                    continue;
                }
            };

            if rows.is_empty() {
                break;
            }
            let read = rows.len();
            result.rows_attempted += read as u64;

            match self.write_batch(table, rows, options, ctx).await {
                Ok(outcome) => {
                    result.rows_inserted += outcome.inserted;
                    result.rows_skipped += outcome.skipped;
                    ctx.reporter.progress().rows_done(outcome.inserted + outcome.skipped);
                    if let Some(message) = outcome.warning {
                        ctx.reporter.record(
                            MigrationError::new(ErrorLevel::Warning, Phase::Seeding, message.clone())
                                .with_table(&table.name),
                        );
                        result.batch_errors.push(BatchError {
                            batch_index,
                            offset,
                            message,
                            timestamp: Utc::now(),
                        });
                    }
                    if let Some(failure) = outcome.failure {
                        let message = format!("batch {} at offset {}: {}", batch_index, offset, failure);
                        report(message.clone());
                        result.batch_errors.push(BatchError {
                            batch_index,
                            offset,
                            message,
                            timestamp: Utc::now(),
                        });
                        let settled = outcome.inserted + outcome.skipped;
                        ctx.reporter.progress().rows_done((read as u64).saturating_sub(settled));
                        stopped = true;
                        break;
                    }
                }
                Err(e) => {
                    let message = format!("batch {} at offset {}: {}", batch_index, offset, e);
                    report(message.clone());
                    result.batch_errors.push(BatchError {
                        batch_index,
                        offset,
                        message,
                        timestamp: Utc::now(),
                    });
                    ctx.reporter.progress().rows_done(read as u64);
                    if !seeding.continue_on_error {
                        stopped = true;
                        break;
                    }
                }
            }

            debug!("{}: batch {} done ({} rows)", table.name, batch_index, read);
            offset += read as u64;
            batch_index += 1;
            if read < seeding.batch_size {
                break;
            }
        }

        if stopped && !seeding.continue_on_error {
            halt.store(true, Ordering::SeqCst);
        }

        let failed = stopped || !result.batch_errors.is_empty();
        result.status = if cancelled {
            TableSeedStatus::Cancelled
        } else if result.rows_inserted == 0 && (failed || result.rows_attempted > 0) {
            TableSeedStatus::Failed
        } else if failed || result.rows_inserted < result.rows_attempted {
            TableSeedStatus::PartiallySeeded
        } else {
            TableSeedStatus::Completed
        };

        if result.status != TableSeedStatus::Cancelled {
            ctx.reporter.progress().table_done();
        }
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Clear or create the target table as the options ask.
    async fn prepare_table(&self, table: &Table, options: &MigrationOptions) -> Result<Prepared> {
        let mut prepared = Prepared::default();
        if self.target.table_exists(&table.name).await? {
            if options.clear_existing_data {
                let removed = self.target.clear_table(&table.name).await?;
                prepared.cleared = true;
                debug!("{}: cleared {} existing rows", table.name, removed);
            }
            return Ok(prepared);
        }

        if !options.create_missing_tables {
            return Err(MigrateError::operation(
                &table.name,
                "table does not exist in target and createMissingTables is off",
            ));
        }
        self.target.create_table(table).await?;
        prepared.created = true;
        info!("{}: created in target", table.name);
        Ok(prepared)
    }

    /// Validate and write one batch.
    ///
    /// Returns Err when nothing of the batch was written. Rejected rows that
    /// were skipped under `continueOnError` come back as `skipped` with a
    /// warning; without it a partial write comes back with `failure` set and
    /// the rows that did commit in `inserted`.
    async fn write_batch(
        &self,
        table: &Table,
        rows: Vec<Row>,
        options: &MigrationOptions,
        ctx: &RunContext,
    ) -> Result<BatchOutcome> {
        let seeding = &options.seeding;
        let mut rows = rows;
        let mut skipped = 0u64;
        let mut notes = Vec::new();

        if seeding.validate_before_insert {
            let violations = self.validator.validate(table, &rows);
            if !violations.is_empty() {
                let first = &violations[0];
                if !seeding.continue_on_error {
                    return Err(MigrateError::operation(
                        &table.name,
                        format!("row {} failed validation: {}", first.row, first.reason),
                    ));
                }
                let rejected: std::collections::HashSet<usize> = violations.iter().map(|v| v.row).collect();
                rows = rows
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| !rejected.contains(i))
                    .map(|(_, r)| r)
                    .collect();
                skipped += violations.len() as u64;
                notes.push(format!(
                    "{} rows failed validation (first: row {}: {})",
                    violations.len(),
                    first.row,
                    first.reason
                ));
            }
        }

        if rows.is_empty() {
            return Ok(BatchOutcome {
                inserted: 0,
                skipped,
                warning: (!notes.is_empty()).then(|| notes.join("; ")),
                failure: None,
            });
        }

        // A timed-out write is only safe to repeat when it rolled back.
        let retryable: fn(&MigrateError) -> bool = if seeding.use_transactions {
            is_transient
        } else {
            MigrateError::is_connection_failure
        };
        let batch = rows.as_slice();
        let outcome = with_retry(
            &format!("write to {}", table.name),
            seeding,
            ctx,
            retryable,
            move || async move {
                match tokio::time::timeout(
                    seeding.command_timeout(),
                    self.target.write_batch(table, batch, seeding.use_transactions),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(MigrateError::timeout(
                        format!("write to {}", table.name),
                        seeding.command_timeout_secs,
                    )),
                }
            },
        )
        .await?;

        if !outcome.failed.is_empty() {
            let (row, reason) = &outcome.failed[0];
            if !seeding.continue_on_error {
                // Rows written before the rejection stay committed.
                return Ok(BatchOutcome {
                    inserted: outcome.written,
                    skipped: 0,
                    warning: None,
                    failure: Some(format!(
                        "{} rows rejected, {} written (first: row {}: {})",
                        outcome.failed.len(),
                        outcome.written,
                        row,
                        reason
                    )),
                });
            }
            warn!("{}: {} rows rejected by target", table.name, outcome.failed.len());
            skipped += outcome.failed.len() as u64;
            notes.push(format!(
                "{} rows rejected by target (first: row {}: {})",
                outcome.failed.len(),
                row,
                reason
            ));
        }

        Ok(BatchOutcome {
            inserted: outcome.written,
            skipped,
            warning: (!notes.is_empty()).then(|| notes.join("; ")),
            failure: None,
        })
    }
}

#[derive(Default)]
struct Prepared {
    created: bool,
    cleared: bool,
}

struct BatchOutcome {
    inserted: u64,
    skipped: u64,
    warning: Option<String>,
    /// Set when rows were rejected and `continueOnError` is off.
    failure: Option<String>,
}

/// Connection failures and timeouts; a retry may succeed.
fn is_transient(e: &MigrateError) -> bool {
    e.is_connection_failure() || matches!(e, MigrateError::Timeout { .. })
}

/// Run `attempt` until it succeeds, fails with an error `retryable`
/// rejects, or `maxRetries` retries are spent. Delays grow exponentially
/// up to `maxRetryDelayMs`; a cancelled run is not retried.
async fn with_retry<T, F, Fut>(
    what: &str,
    seeding: &SeedingOptions,
    ctx: &RunContext,
    retryable: fn(&MigrateError) -> bool,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0u32;
    loop {
        match attempt().await {
            Err(e) if retryable(&e) && retries < seeding.max_retries && !ctx.control.is_cancelled() => {
                retries += 1;
                let delay = seeding.retry_delay(retries);
                warn!(
                    "{} failed ({}), retry {}/{} in {}ms",
                    what,
                    e,
                    retries,
                    seeding.max_retries,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, ColumnType, SqlValue};
    use crate::drivers::MemoryStore;
    use std::time::Duration;

    fn samples(rows: usize) -> (Table, Vec<Row>) {
        let table = Table::new(
            "Samples",
            vec![
                Column::new("id", ColumnType::Int).not_null(),
                Column::new("code", ColumnType::Text),
            ],
        )
        .with_primary_key(&["id"]);
        let data = (0..rows)
            .map(|i| vec![SqlValue::Int(i as i64), SqlValue::from(format!("S-{}", i))])
            .collect();
        (table, data)
    }

    fn options(batch_size: usize) -> MigrationOptions {
        let mut options = MigrationOptions::default();
        options.seeding.batch_size = batch_size;
        options
    }

    async fn source_tables(source: &MemoryStore) -> Vec<Table> {
        source.list_tables().await.unwrap()
    }

    #[tokio::test]
    async fn test_seeds_all_tables_in_order() {
        let source = Arc::new(MemoryStore::new("legacy"));
        for (name, count) in [("A", 10), ("B", 0), ("C", 5)] {
            let (mut table, rows) = samples(count);
            table.name = name.to_string();
            source.insert_table(table, rows);
        }
        let target = Arc::new(MemoryStore::new("target"));
        let seeder = BatchSeeder::new(source.clone(), target.clone());

        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &options(4), &RunContext::detached()).await;

        assert!(result.success);
        assert_eq!(result.total_rows_inserted, 15);
        let names: Vec<&str> = result.table_results.iter().map(|t| t.table_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert!(result.table_results.iter().all(|t| t.table_created));
        assert_eq!(target.rows("A").len(), 10);
        assert_eq!(result.table_results[1].status, TableSeedStatus::Completed);
    }

    #[tokio::test]
    async fn test_clears_existing_rows() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(3);
        source.insert_table(table.clone(), rows);
        let target = Arc::new(MemoryStore::new("target"));
        let (_, stale) = samples(2);
        target.insert_table(table, stale);

        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &options(10), &RunContext::detached()).await;

        assert!(result.table_results[0].cleared);
        assert!(!result.table_results[0].table_created);
        assert_eq!(target.rows("Samples").len(), 3);
    }

    #[tokio::test]
    async fn test_missing_table_without_create_fails() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(3);
        source.insert_table(table, rows);
        let target = Arc::new(MemoryStore::new("target"));

        let mut opts = options(10);
        opts.create_missing_tables = false;
        let seeder = BatchSeeder::new(source.clone(), target);
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &opts, &RunContext::detached()).await;

        assert_eq!(result.table_results[0].status, TableSeedStatus::Failed);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_transactional_batch_failure_rolls_back_only_that_batch() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(30);
        source.insert_table(table, rows);
        let target = Arc::new(MemoryStore::new("target"));
        let (t, _) = samples(0);
        target.insert_table(t, Vec::new());
        // Row 15 sits in the second batch of 10.
        target.fail_rows_where("Samples", |row| row[0] == SqlValue::Int(15));

        let mut opts = options(10);
        opts.seeding.validate_before_insert = false;
        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &opts, &RunContext::detached()).await;

        let table = &result.table_results[0];
        assert_eq!(table.rows_inserted, 20);
        assert_eq!(table.batch_errors.len(), 1);
        assert_eq!(table.batch_errors[0].batch_index, 1);
        assert_eq!(table.status, TableSeedStatus::PartiallySeeded);
        assert_eq!(target.rows("Samples").len(), 20);
        assert!(result.fatal.is_none());
    }

    #[tokio::test]
    async fn test_stop_on_error_halts_dispatch() {
        let source = Arc::new(MemoryStore::new("legacy"));
        for name in ["A", "B", "C"] {
            let (mut table, rows) = samples(20);
            table.name = name.to_string();
            source.insert_table(table, rows);
        }
        let target = Arc::new(MemoryStore::new("target"));
        let (mut a, _) = samples(0);
        a.name = "A".into();
        target.insert_table(a, Vec::new());
        target.fail_rows_where("A", |row| row[0] == SqlValue::Int(12));

        let mut opts = options(10);
        opts.max_concurrent_operations = 1;
        opts.seeding.continue_on_error = false;
        let ctx = RunContext::detached();
        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &opts, &ctx).await;

        assert_eq!(result.table_results[0].status, TableSeedStatus::PartiallySeeded);
        assert_eq!(result.table_results[0].rows_inserted, 10);
        assert_eq!(result.table_results[1].status, TableSeedStatus::Skipped);
        assert_eq!(result.table_results[2].status, TableSeedStatus::Skipped);
        assert!(result.fatal.is_some());
        assert!(ctx.reporter.has_fatal());
    }

    #[tokio::test]
    async fn test_invalid_rows_skipped_when_continuing() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, mut rows) = samples(5);
        rows[2][1] = SqlValue::Int(99);
        source.insert_table(table, rows);
        let target = Arc::new(MemoryStore::new("target"));

        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &options(10), &RunContext::detached()).await;

        let table = &result.table_results[0];
        assert_eq!(table.rows_inserted, 4);
        assert_eq!(table.rows_skipped, 1);
        assert_eq!(table.status, TableSeedStatus::PartiallySeeded);
    }

    #[tokio::test]
    async fn test_invalid_row_fails_batch_when_stopping() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, mut rows) = samples(5);
        rows[2][1] = SqlValue::Int(99);
        source.insert_table(table, rows);
        let target = Arc::new(MemoryStore::new("target"));

        let mut opts = options(10);
        opts.seeding.continue_on_error = false;
        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &opts, &RunContext::detached()).await;

        assert_eq!(result.table_results[0].status, TableSeedStatus::Failed);
        assert!(target.rows("Samples").is_empty());
    }

    #[tokio::test]
    async fn test_write_timeout_is_batch_failure() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(3);
        source.insert_table(table, rows);
        let target = Arc::new(MemoryStore::new("target").with_write_latency(Duration::from_millis(1500)));

        let mut opts = options(10);
        opts.seeding.command_timeout_secs = 1;
        opts.seeding.max_retries = 0;
        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &opts, &RunContext::detached()).await;

        let table = &result.table_results[0];
        assert_eq!(table.status, TableSeedStatus::Failed);
        assert!(table.batch_errors[0].message.contains("Timed out"));
        assert!(target.rows("Samples").is_empty());
    }

    #[tokio::test]
    async fn test_partial_write_counts_committed_rows_when_stopping() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(10);
        source.insert_table(table, rows);
        let target = Arc::new(MemoryStore::new("target"));
        target.fail_rows_where("Samples", |row| row[0] == SqlValue::Int(5));

        let mut opts = options(10);
        opts.seeding.use_transactions = false;
        opts.seeding.continue_on_error = false;
        opts.seeding.validate_before_insert = false;
        let ctx = RunContext::detached();
        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &opts, &ctx).await;

        let table = &result.table_results[0];
        assert_eq!(target.rows("Samples").len(), 9);
        assert_eq!(table.rows_inserted, 9);
        assert_eq!(result.total_rows_inserted, 9);
        assert_eq!(table.status, TableSeedStatus::PartiallySeeded);
        assert_eq!(table.batch_errors.len(), 1);
        assert!(table.batch_errors[0].message.contains("9 written"));
        assert!(result.fatal.is_some());
        assert_eq!(ctx.reporter.progress().snapshot(0).processed_rows, 10);
    }

    #[tokio::test]
    async fn test_read_timeouts_skip_batches_when_continuing() {
        let source = Arc::new(MemoryStore::new("legacy").with_latency(Duration::from_millis(1500)));
        let (table, rows) = samples(30);
        source.insert_table(table, rows);
        let target = Arc::new(MemoryStore::new("target"));

        let mut opts = options(10);
        opts.seeding.command_timeout_secs = 1;
        opts.seeding.max_retries = 0;
        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;
        let result = seeder.seed(&tables, &opts, &RunContext::detached()).await;

        let table = &result.table_results[0];
        let offsets: Vec<u64> = table.batch_errors.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20]);
        assert!(table.batch_errors.iter().all(|e| e.message.contains("Timed out")));
        assert_eq!(table.status, TableSeedStatus::Failed);
        assert_eq!(table.rows_inserted, 0);
        assert!(result.fatal.is_none());
    }

    #[tokio::test]
    async fn test_read_failure_stops_table_when_not_continuing() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(30);
        source.insert_table(table, rows);
        let tables = source_tables(&source).await;
        source.set_offline(true);

        let mut opts = options(10);
        opts.seeding.continue_on_error = false;
        opts.seeding.max_retries = 0;
        let seeder = BatchSeeder::new(source.clone(), Arc::new(MemoryStore::new("target")));
        let result = seeder.seed(&tables, &opts, &RunContext::detached()).await;

        let table = &result.table_results[0];
        assert_eq!(table.batch_errors.len(), 1);
        assert_eq!(table.status, TableSeedStatus::Failed);
        assert!(result.fatal.is_some());
    }

    #[tokio::test]
    async fn test_connection_failure_retried_until_store_returns() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(10);
        source.insert_table(table, rows);
        let tables = source_tables(&source).await;
        let target = Arc::new(MemoryStore::new("target"));
        source.set_offline(true);

        let reconnect = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            reconnect.set_offline(false);
        });

        let mut opts = options(10);
        opts.seeding.retry_delay_ms = 100;
        opts.seeding.max_retry_delay_ms = 1000;
        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let result = seeder.seed(&tables, &opts, &RunContext::detached()).await;

        let table = &result.table_results[0];
        assert_eq!(table.status, TableSeedStatus::Completed, "{:?}", table.batch_errors);
        assert_eq!(table.rows_inserted, 10);
        assert_eq!(target.rows("Samples").len(), 10);
    }

    #[tokio::test]
    async fn test_retries_exhausted_on_dead_store() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(30);
        source.insert_table(table, rows);
        let tables = source_tables(&source).await;
        source.set_offline(true);

        let mut opts = options(10);
        opts.seeding.max_retries = 2;
        opts.seeding.retry_delay_ms = 10;
        let seeder = BatchSeeder::new(source.clone(), Arc::new(MemoryStore::new("target")));
        let started = Instant::now();
        let result = seeder.seed(&tables, &opts, &RunContext::detached()).await;

        let table = &result.table_results[0];
        assert_eq!(table.batch_errors.len(), 3);
        assert!(table.batch_errors[0].message.contains("connection refused"));
        assert_eq!(table.status, TableSeedStatus::Failed);
        // Three batches, each with a 10ms and a 20ms wait.
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_rejected_statement_not_retried() {
        let source = Arc::new(MemoryStore::new("legacy"));
        // Listed to the seeder but absent from the source.
        let (mut missing, _) = samples(5);
        missing.row_count = 5;
        let target = Arc::new(MemoryStore::new("target"));

        let mut opts = options(10);
        opts.seeding.retry_delay_ms = 2000;
        opts.seeding.max_retry_delay_ms = 2000;
        let seeder = BatchSeeder::new(source, target);
        let started = Instant::now();
        let result = seeder
            .seed(&[missing], &opts, &RunContext::detached())
            .await;

        let table = &result.table_results[0];
        assert_eq!(table.batch_errors.len(), 1);
        assert!(table.batch_errors[0].message.contains("does not exist"));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_batch_finish() {
        let source = Arc::new(MemoryStore::new("legacy"));
        let (table, rows) = samples(3000);
        source.insert_table(table, rows);
        let target = Arc::new(MemoryStore::new("target").with_write_latency(Duration::from_millis(300)));

        let ctx = RunContext::detached();
        let seeder = BatchSeeder::new(source.clone(), target.clone());
        let tables = source_tables(&source).await;

        let run_ctx = ctx.clone();
        let opts = options(1000);
        let handle = tokio::spawn(async move { seeder.seed(&tables, &opts, &run_ctx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.control.cancel();
        let result = handle.await.unwrap();

        let table = &result.table_results[0];
        assert_eq!(table.status, TableSeedStatus::Cancelled);
        assert_eq!(table.rows_inserted, 1000);
        assert_eq!(target.rows("Samples").len(), 1000);
        assert_eq!(ctx.reporter.progress().snapshot(0).processed_rows, 1000);
    }

    #[tokio::test]
    async fn test_select_tables_applies_filters() {
        let source = Arc::new(MemoryStore::new("legacy"));
        for name in ["Users", "Samples", "AuditLog"] {
            let (mut table, _) = samples(0);
            table.name = name.to_string();
            source.insert_table(table, Vec::new());
        }
        let seeder = BatchSeeder::new(source, Arc::new(MemoryStore::new("target")));
        let mut opts = MigrationOptions::default();
        opts.exclude_tables = vec!["audit*".into()];
        let names: Vec<String> = seeder
            .select_tables(&opts)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["Samples", "Users"]);
    }
}
