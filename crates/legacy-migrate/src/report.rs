//! Run reports (JSON, CSV) and plain-text logs.

use std::fmt::Write as FmtWrite;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;

use crate::error::{MigrateError, Result};
use crate::history::{ErrorLevel, MigrationError, MigrationRun, RunStatus};
use crate::logging::LogLine;
use crate::verify::QueryOutcome;

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for ReportFormat {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            other => Err(MigrateError::Validation(format!(
                "unsupported report format '{}' (expected json or csv)",
                other
            ))),
        }
    }
}

/// Minimum severity included in a log rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevelFilter {
    #[default]
    All,
    Warning,
    Error,
}

impl LogLevelFilter {
    fn admits_line(&self, line: &LogLine) -> bool {
        match self {
            LogLevelFilter::All => true,
            LogLevelFilter::Warning => line.at_least(Level::WARN),
            LogLevelFilter::Error => line.at_least(Level::ERROR),
        }
    }

    fn admits_error(&self, err: &MigrationError) -> bool {
        match self {
            LogLevelFilter::All => true,
            LogLevelFilter::Warning => true,
            LogLevelFilter::Error => err.level >= ErrorLevel::Error,
        }
    }
}

impl FromStr for LogLevelFilter {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" | "info" => Ok(LogLevelFilter::All),
            "warning" | "warn" => Ok(LogLevelFilter::Warning),
            "error" => Ok(LogLevelFilter::Error),
            other => Err(MigrateError::Validation(format!(
                "unsupported log level '{}' (expected all, warning or error)",
                other
            ))),
        }
    }
}

/// A rendered report ready to be served as a download.
#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub content_type: &'static str,
    pub file_name: String,
    pub body: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    generated_at: DateTime<Utc>,
    duration_secs: f64,
    success: bool,
    run: &'a MigrationRun,
}

/// Render a run in `format`.
pub fn render(run: &MigrationRun, format: ReportFormat) -> Result<RenderedReport> {
    match format {
        ReportFormat::Json => {
            let report = JsonReport {
                generated_at: Utc::now(),
                duration_secs: duration_secs(run),
                success: run.status == RunStatus::Completed,
                run,
            };
            Ok(RenderedReport {
                content_type: "application/json",
                file_name: format!("migration-report-{}.json", run.migration_id),
                body: serde_json::to_string_pretty(&report)?,
            })
        }
        ReportFormat::Csv => Ok(RenderedReport {
            content_type: "text/csv",
            file_name: format!("migration-report-{}.csv", run.migration_id),
            body: render_csv(run),
        }),
    }
}

fn duration_secs(run: &MigrationRun) -> f64 {
    run.duration().num_milliseconds().max(0) as f64 / 1000.0
}

/// Quote a CSV field when it contains a separator, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(out: &mut String, fields: &[&str]) {
    let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
    out.push_str(&row.join(","));
    out.push('\n');
}

fn render_csv(run: &MigrationRun) -> String {
    let mut out = String::new();
    let stats = &run.statistics;

    out.push_str("Migration Report\n");
    csv_row(&mut out, &["Migration ID", &run.migration_id]);
    csv_row(&mut out, &["Status", &format!("{:?}", run.status)]);
    csv_row(&mut out, &["Duration (s)", &format!("{:.3}", duration_secs(run))]);
    csv_row(&mut out, &["Generated At", &Utc::now().to_rfc3339()]);
    out.push('\n');

    out.push_str("Summary\n");
    csv_row(&mut out, &["Metric", "Value"]);
    for (metric, value) in [
        ("Total Tables", stats.total_tables),
        ("Tables Processed", stats.processed_tables),
        ("Total Rows", stats.total_rows),
        ("Rows Processed", stats.processed_rows),
        ("Queries Attempted", stats.queries_attempted),
        ("Files Processed", stats.files_processed),
        ("Error Count", stats.error_count),
    ] {
        csv_row(&mut out, &[metric, &value.to_string()]);
    }
    out.push('\n');

    if let Some(seeding) = &run.seeding_result {
        out.push_str("Tables\n");
        csv_row(&mut out, &["Table", "Status", "Attempted", "Inserted", "Skipped", "Batch Errors", "Elapsed (ms)"]);
        for t in &seeding.table_results {
            csv_row(
                &mut out,
                &[
                    &t.table_name,
                    &format!("{:?}", t.status),
                    &t.rows_attempted.to_string(),
                    &t.rows_inserted.to_string(),
                    &t.rows_skipped.to_string(),
                    &t.batch_errors.len().to_string(),
                    &t.elapsed_ms.to_string(),
                ],
            );
        }
        out.push('\n');
    }

    if let Some(validation) = &run.validation_result {
        out.push_str("Queries\n");
        csv_row(&mut out, &["Query", "Outcome", "Discrepancies", "Legacy (ms)", "Current (ms)", "Ratio", "Regression"]);
        for q in &validation.query_results {
            let outcome = match &q.outcome {
                QueryOutcome::Matched => "Matched".to_string(),
                QueryOutcome::Mismatched => "Mismatched".to_string(),
                QueryOutcome::Failed { message, .. } => format!("Failed: {}", message),
            };
            csv_row(
                &mut out,
                &[
                    &q.query_name,
                    &outcome,
                    &q.total_discrepancies.to_string(),
                    &format!("{:.2}", q.legacy_execution_ms),
                    &format!("{:.2}", q.current_execution_ms),
                    &format!("{:.3}", q.performance_ratio),
                    &q.performance_regression.to_string(),
                ],
            );
        }
        csv_row(
            &mut out,
            &["Match Percentage", &format!("{:.2}", validation.summary.match_percentage)],
        );
        out.push('\n');
    }

    if let Some(auth) = &run.auth_removal_result {
        out.push_str("Authentication Removal\n");
        csv_row(&mut out, &["Kind", "Item", "File", "Timestamp"]);
        let sections = [
            ("Backup", &auth.backup_files),
            ("Modified", &auth.modified_files),
            ("Removed", &auth.removed_components),
        ];
        for (kind, entries) in sections {
            for e in entries {
                csv_row(
                    &mut out,
                    &[kind, &e.item, e.file.as_deref().unwrap_or(""), &e.timestamp.to_rfc3339()],
                );
            }
        }
        if let Some(id) = &auth.backup_id {
            csv_row(&mut out, &["Backup ID", id]);
        }
        out.push('\n');
    }

    if !run.errors.is_empty() {
        out.push_str("Errors\n");
        csv_row(&mut out, &["Timestamp", "Level", "Phase", "Identifier", "Message"]);
        for e in &run.errors {
            csv_row(
                &mut out,
                &[
                    &e.timestamp.to_rfc3339(),
                    &format!("{:?}", e.level),
                    &format!("{:?}", e.phase),
                    e.identifier().unwrap_or(""),
                    &e.message,
                ],
            );
        }
    }

    out
}

/// Plain-text log of a run.
///
/// Captured lines are listed when there are any; the run's recorded
/// errors are listed otherwise.
pub fn render_logs(run: &MigrationRun, lines: &[LogLine], filter: LogLevelFilter) -> String {
    let mut out = String::new();
    out.push_str("Migration Log\n");
    out.push_str("=============\n");
    let _ = writeln!(out, "Migration: {}", run.migration_id);
    let _ = writeln!(out, "Status: {:?}", run.status);
    out.push('\n');

    if !lines.is_empty() {
        for line in lines.iter().filter(|l| filter.admits_line(l)) {
            let _ = writeln!(
                out,
                "[{}] [{}] {}: {}",
                line.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                line.level,
                line.target,
                line.message
            );
        }
        return out;
    }

    let mut errors: Vec<&MigrationError> = run.errors.iter().filter(|e| filter.admits_error(e)).collect();
    errors.sort_by_key(|e| e.timestamp);
    for e in errors {
        let _ = writeln!(
            out,
            "[{}] [{:?}] {:?}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.level,
            e.phase
        );
        let _ = writeln!(out, "Message: {}", e.message);
        if let Some(table) = &e.table {
            let _ = writeln!(out, "Table: {}", table);
        }
        if let Some(query) = &e.query {
            let _ = writeln!(out, "Query: {}", query);
        }
        if let Some(file) = &e.file {
            let _ = writeln!(out, "File: {}", file);
        }
        if let Some(details) = &e.details {
            let _ = writeln!(out, "Details: {}", details);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationOptions;
    use crate::history::Phase;

    fn failed_run() -> MigrationRun {
        let mut run = MigrationRun::new("run-1", MigrationOptions::default());
        run.status = RunStatus::Failed;
        run.errors = vec![
            MigrationError::new(ErrorLevel::Warning, Phase::Seeding, "slow batch").with_table("Users"),
            MigrationError::new(ErrorLevel::Fatal, Phase::Validation, "legacy unreachable, \"timeout\"")
                .with_query("counts"),
        ];
        run
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!("CSV".parse::<ReportFormat>().unwrap(), ReportFormat::Csv);
        assert!("xml".parse::<ReportFormat>().is_err());
        assert_eq!("warning".parse::<LogLevelFilter>().unwrap(), LogLevelFilter::Warning);
        assert!("verbose".parse::<LogLevelFilter>().is_err());
    }

    #[test]
    fn test_json_report() {
        let report = render(&failed_run(), ReportFormat::Json).unwrap();
        assert_eq!(report.content_type, "application/json");
        assert_eq!(report.file_name, "migration-report-run-1.json");
        let json: serde_json::Value = serde_json::from_str(&report.body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["run"]["migrationId"], "run-1");
    }

    #[test]
    fn test_csv_quotes_fields() {
        let report = render(&failed_run(), ReportFormat::Csv).unwrap();
        assert_eq!(report.content_type, "text/csv");
        assert!(report.body.starts_with("Migration Report\nMigration ID,run-1\n"));
        assert!(report.body.contains("\"legacy unreachable, \"\"timeout\"\"\""));
        assert!(report.body.contains("Warning,Seeding,Users,slow batch"));
    }

    #[test]
    fn test_logs_from_errors_filtered() {
        let text = render_logs(&failed_run(), &[], LogLevelFilter::Error);
        assert!(text.starts_with("Migration Log\n=============\n"));
        assert!(text.contains("Message: legacy unreachable"));
        assert!(text.contains("Query: counts"));
        assert!(!text.contains("slow batch"));
    }

    #[test]
    fn test_logs_from_captured_lines() {
        let line = |level: &str, message: &str| LogLine {
            timestamp: Utc::now(),
            level: level.into(),
            target: "legacy_migrate::seeder".into(),
            message: message.into(),
        };
        let lines = vec![line("INFO", "seeding"), line("WARN", "row skipped")];
        let text = render_logs(&failed_run(), &lines, LogLevelFilter::Warning);
        assert!(text.contains("[WARN] legacy_migrate::seeder: row skipped"));
        assert!(!text.contains("seeding"));
    }
}
