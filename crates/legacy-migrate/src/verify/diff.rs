//! Row and field diffing of two result sets.

use std::collections::HashMap;

use super::normalize::{compare, key_text, Comparison};
use super::types::{Discrepancy, DiscrepancyKind};
use crate::core::{QueryResult, SqlValue};

/// Discrepancies found between two result sets.
#[derive(Debug, Default)]
pub struct DiffReport {
    /// Retained discrepancies, capped at the configured maximum.
    pub discrepancies: Vec<Discrepancy>,
    /// Every discrepancy found.
    pub total: u64,
}

struct Collector {
    report: DiffReport,
    max: usize,
}

impl Collector {
    fn push(&mut self, d: Discrepancy) {
        self.report.total += 1;
        if self.report.discrepancies.len() < self.max {
            self.report.discrepancies.push(d);
        }
    }
}

/// Columns present on both sides, as (legacy index, current index, name).
fn shared_columns(legacy: &QueryResult, current: &QueryResult, out: &mut Collector) -> Vec<(usize, usize, String)> {
    let mut shared = Vec::new();
    for (li, name) in legacy.columns.iter().enumerate() {
        match current.column_index(name) {
            Some(ci) => shared.push((li, ci, name.clone())),
            None => out.push(Discrepancy {
                field_name: name.clone(),
                row_identifier: "*".into(),
                legacy_value: Some("column present".into()),
                current_value: None,
                kind: DiscrepancyKind::MissingInCurrent,
            }),
        }
    }
    for name in &current.columns {
        if legacy.column_index(name).is_none() {
            out.push(Discrepancy {
                field_name: name.clone(),
                row_identifier: "*".into(),
                legacy_value: None,
                current_value: Some("column present".into()),
                kind: DiscrepancyKind::MissingInLegacy,
            });
        }
    }
    shared
}

fn compare_rows(
    legacy: &[SqlValue],
    current: &[SqlValue],
    columns: &[(usize, usize, String)],
    row_id: &str,
    lenient: bool,
    out: &mut Collector,
) {
    for (li, ci, name) in columns {
        let (Some(l), Some(c)) = (legacy.get(*li), current.get(*ci)) else {
            continue;
        };
        let kind = match compare(l, c, lenient) {
            Comparison::Equal => continue,
            Comparison::Different => DiscrepancyKind::ValueMismatch,
            Comparison::TypeMismatch => DiscrepancyKind::TypeMismatch,
        };
        out.push(Discrepancy {
            field_name: name.clone(),
            row_identifier: row_id.to_string(),
            legacy_value: Some(l.to_string()),
            current_value: Some(c.to_string()),
            kind,
        });
    }
}

fn missing_row(row_id: String, kind: DiscrepancyKind) -> Discrepancy {
    Discrepancy {
        field_name: "*".into(),
        row_identifier: row_id,
        legacy_value: None,
        current_value: None,
        kind,
    }
}

/// Identifier for a row without key columns: position plus leading fields.
fn positional_id(index: usize, row: &[SqlValue]) -> String {
    let head: Vec<String> = row.iter().take(3).map(|v| v.to_string()).collect();
    format!("#{} ({})", index + 1, head.join(", "))
}

/// Diff two result sets.
///
/// Rows are matched by `key_columns` when every key column exists on both
/// sides, otherwise by position. Fields are compared over the shared
/// columns; columns on only one side are reported once each.
pub fn diff_results(
    legacy: &QueryResult,
    current: &QueryResult,
    key_columns: &[String],
    lenient: bool,
    max: usize,
) -> DiffReport {
    let mut out = Collector {
        report: DiffReport::default(),
        max,
    };

    if legacy.rows.len() != current.rows.len() {
        out.push(Discrepancy {
            field_name: "*".into(),
            row_identifier: "*".into(),
            legacy_value: Some(legacy.rows.len().to_string()),
            current_value: Some(current.rows.len().to_string()),
            kind: DiscrepancyKind::RowCountMismatch,
        });
    }

    let columns = shared_columns(legacy, current, &mut out);

    let keys: Option<Vec<(usize, usize, &String)>> = if key_columns.is_empty() {
        None
    } else {
        key_columns
            .iter()
            .map(|k| Some((legacy.column_index(k)?, current.column_index(k)?, k)))
            .collect()
    };

    match keys {
        Some(keys) => {
            let key_of = |row: &[SqlValue], legacy_side: bool| -> String {
                keys.iter()
                    .map(|(li, ci, _)| {
                        let idx = if legacy_side { *li } else { *ci };
                        row.get(idx).map(|v| key_text(v, lenient)).unwrap_or_default()
                    })
                    .collect::<Vec<_>>()
                    .join("\u{1f}")
            };
            let label_of = |row: &[SqlValue]| -> String {
                keys.iter()
                    .map(|(li, _, name)| {
                        format!("{}={}", name, row.get(*li).map(|v| v.to_string()).unwrap_or_default())
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            };

            let mut index: HashMap<String, usize> = HashMap::with_capacity(current.rows.len());
            for (i, row) in current.rows.iter().enumerate() {
                index.entry(key_of(row, false)).or_insert(i);
            }
            let mut matched = vec![false; current.rows.len()];

            for row in &legacy.rows {
                let label = label_of(row);
                match index.get(&key_of(row, true)) {
                    Some(&ci) if !matched[ci] => {
                        matched[ci] = true;
                        compare_rows(row, &current.rows[ci], &columns, &label, lenient, &mut out);
                    }
                    _ => out.push(missing_row(label, DiscrepancyKind::MissingInCurrent)),
                }
            }
            for (ci, row) in current.rows.iter().enumerate() {
                if !matched[ci] {
                    let label = keys
                        .iter()
                        .map(|(_, idx, name)| {
                            format!("{}={}", name, row.get(*idx).map(|v| v.to_string()).unwrap_or_default())
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    out.push(missing_row(label, DiscrepancyKind::MissingInLegacy));
                }
            }
        }
        None => {
            for (i, (l, c)) in legacy.rows.iter().zip(&current.rows).enumerate() {
                compare_rows(l, c, &columns, &positional_id(i, l), lenient, &mut out);
            }
            let shared = legacy.rows.len().min(current.rows.len());
            for (i, row) in legacy.rows.iter().enumerate().skip(shared) {
                out.push(missing_row(positional_id(i, row), DiscrepancyKind::MissingInCurrent));
            }
            for (i, row) in current.rows.iter().enumerate().skip(shared) {
                out.push(missing_row(positional_id(i, row), DiscrepancyKind::MissingInLegacy));
            }
        }
    }

    out.report
}
