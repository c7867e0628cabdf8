//! Per-batch row validation before insert.

use crate::core::{Row, Table};

/// A row rejected by a [`RowValidator`].
#[derive(Debug, Clone, PartialEq)]
pub struct RowViolation {
    /// Position of the row within the batch.
    pub row: usize,
    pub reason: String,
}

/// Checks a batch of rows before it is written.
///
/// Called once per batch when `validateBeforeInsert` is set. Returns the
/// rejected rows; an empty vector accepts the whole batch.
pub trait RowValidator: Send + Sync {
    fn validate(&self, table: &Table, rows: &[Row]) -> Vec<RowViolation>;
}

/// Default validator: column count, nullability, type and length checks
/// against the table metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaRowValidator;

impl RowValidator for SchemaRowValidator {
    fn validate(&self, table: &Table, rows: &[Row]) -> Vec<RowViolation> {
        rows.iter()
            .enumerate()
            .filter_map(|(row, values)| {
                table
                    .check_row(values)
                    .map(|reason| RowViolation { row, reason })
            })
            .collect()
    }
}
