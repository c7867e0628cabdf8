//! Type definitions for differential validation.

use serde::{Deserialize, Serialize};

use crate::config::QueryConfig;
use crate::core::{DataQuery, Table};

/// A named pair of queries compared across the two stores.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefinition {
    pub name: String,
    pub legacy: DataQuery,
    pub current: DataQuery,

    /// Columns identifying a row. Empty means positional comparison.
    pub key_columns: Vec<String>,

    /// Failures or mismatches are flagged as critical issues.
    pub critical: bool,
}

impl QueryDefinition {
    /// Compare a whole table, keyed by its primary key.
    pub fn table_scan(table: &Table) -> Self {
        let order_by = if table.primary_key.is_empty() {
            table.column_names()
        } else {
            table.primary_key.clone()
        };
        let scan = DataQuery::TableScan {
            table: table.name.clone(),
            order_by,
        };
        Self {
            name: format!("table:{}", table.name),
            legacy: scan.clone(),
            current: scan,
            key_columns: table.primary_key.clone(),
            critical: false,
        }
    }
}

impl From<&QueryConfig> for QueryDefinition {
    fn from(q: &QueryConfig) -> Self {
        let current = q.current_sql.clone().unwrap_or_else(|| q.legacy_sql.clone());
        Self {
            name: q.name.clone(),
            legacy: DataQuery::Sql(q.legacy_sql.clone()),
            current: DataQuery::Sql(current),
            key_columns: q.key_columns.clone(),
            critical: q.critical,
        }
    }
}

/// Kind of field-level difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscrepancyKind {
    ValueMismatch,
    MissingInCurrent,
    MissingInLegacy,
    TypeMismatch,
    RowCountMismatch,
}

/// One difference between the legacy and current results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    pub field_name: String,
    pub row_identifier: String,
    pub legacy_value: Option<String>,
    pub current_value: Option<String>,
    pub kind: DiscrepancyKind,
}

/// How a query comparison ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result")]
pub enum QueryOutcome {
    Matched,
    Mismatched,
    /// The query could not be compared. `fatal` is set when a store was
    /// unreachable, which stops the phase.
    Failed { fatal: bool, message: String },
}

/// Result of comparing one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryComparisonResult {
    pub query_name: String,
    pub legacy_execution_ms: f64,
    pub current_execution_ms: f64,
    pub legacy_row_count: u64,
    pub current_row_count: u64,

    /// Retained discrepancies, at most `maxDiscrepanciesToReport`.
    pub discrepancies: Vec<Discrepancy>,

    /// All discrepancies found, including those not retained.
    pub total_discrepancies: u64,

    /// current / legacy execution time; 0 when the legacy time was 0.
    pub performance_ratio: f64,
    pub degenerate_timing: bool,
    pub performance_regression: bool,
    pub critical: bool,
    pub outcome: QueryOutcome,
}

impl QueryComparisonResult {
    pub(crate) fn failed(name: &str, critical: bool, fatal: bool, message: String) -> Self {
        Self {
            query_name: name.to_string(),
            legacy_execution_ms: 0.0,
            current_execution_ms: 0.0,
            legacy_row_count: 0,
            current_row_count: 0,
            discrepancies: Vec::new(),
            total_discrepancies: 0,
            performance_ratio: 0.0,
            degenerate_timing: true,
            performance_regression: false,
            critical,
            outcome: QueryOutcome::Failed { fatal, message },
        }
    }

    pub fn is_matched(&self) -> bool {
        self.outcome == QueryOutcome::Matched
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, QueryOutcome::Failed { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.outcome, QueryOutcome::Failed { fatal: true, .. })
    }
}

/// Performance ratio of current against legacy time.
///
/// Returns `(ratio, degenerate)`; a zero legacy time gives ratio 0 and
/// marks the timing degenerate.
pub fn performance_ratio(legacy_ms: f64, current_ms: f64) -> (f64, bool) {
    if legacy_ms <= 0.0 {
        (0.0, true)
    } else {
        (current_ms / legacy_ms, false)
    }
}

/// Aggregates over all compared queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub queries_attempted: u64,
    pub queries_matched: u64,
    pub queries_failed: u64,
    pub match_percentage: f64,
    pub total_discrepancies: u64,
    pub average_legacy_ms: f64,
    pub average_current_ms: f64,
    pub critical_issues: Vec<String>,
}

impl ValidationSummary {
    pub fn from_results(results: &[QueryComparisonResult]) -> Self {
        let attempted = results.len() as u64;
        let matched = results.iter().filter(|r| r.is_matched()).count() as u64;
        let failed = results.iter().filter(|r| r.is_failed()).count() as u64;

        let compared: Vec<&QueryComparisonResult> = results.iter().filter(|r| !r.is_failed()).collect();
        let average = |f: fn(&QueryComparisonResult) -> f64| {
            if compared.is_empty() {
                0.0
            } else {
                compared.iter().map(|r| f(r)).sum::<f64>() / compared.len() as f64
            }
        };

        let critical_issues = results
            .iter()
            .filter_map(|r| {
                let prefix = if r.critical { "[critical] " } else { "" };
                match &r.outcome {
                    QueryOutcome::Matched => None,
                    QueryOutcome::Mismatched => Some(format!(
                        "{}{}: Data mismatch ({} discrepancies)",
                        prefix, r.query_name, r.total_discrepancies
                    )),
                    QueryOutcome::Failed { message, .. } => {
                        Some(format!("{}{}: {}", prefix, r.query_name, message))
                    }
                }
            })
            .collect();

        Self {
            queries_attempted: attempted,
            queries_matched: matched,
            queries_failed: failed,
            match_percentage: if attempted == 0 {
                100.0
            } else {
                matched as f64 / attempted as f64 * 100.0
            },
            total_discrepancies: results.iter().map(|r| r.total_discrepancies).sum(),
            average_legacy_ms: average(|r| r.legacy_execution_ms),
            average_current_ms: average(|r| r.current_execution_ms),
            critical_issues,
        }
    }
}

/// Outcome of the validation phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub query_results: Vec<QueryComparisonResult>,
    pub summary: ValidationSummary,
    pub success: bool,

    /// First connection-level failure, which stopped the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    pub elapsed_ms: u64,
}
