//! Data store abstractions used by the migration engine.
//!
//! - [`LegacySource`]: the system being migrated away from, read-only
//! - [`TargetStore`]: the new relational schema being seeded and validated
//!
//! The orchestrator holds both as `Arc<dyn ...>` so the same run logic
//! drives PostgreSQL stores in production and in-memory stores in tests.

use async_trait::async_trait;

use crate::error::Result;

use super::schema::Table;
use super::value::{QueryResult, Row, WriteOutcome};

/// A query that can be executed against either store.
#[derive(Debug, Clone, PartialEq)]
pub enum DataQuery {
    /// Every row of a table, ordered by the given columns.
    TableScan { table: String, order_by: Vec<String> },

    /// Raw SQL text in the store's own dialect.
    Sql(String),
}

impl DataQuery {
    /// Short label for logs.
    pub fn describe(&self) -> String {
        match self {
            DataQuery::TableScan { table, .. } => format!("scan {}", table),
            DataQuery::Sql(sql) => {
                let flat: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
                if flat.chars().count() > 60 {
                    format!("{}...", flat.chars().take(60).collect::<String>())
                } else {
                    flat
                }
            }
        }
    }
}

/// Read access to the legacy system.
#[async_trait]
pub trait LegacySource: Send + Sync {
    /// List tables with columns, primary keys and row counts.
    async fn list_tables(&self) -> Result<Vec<Table>>;

    /// Read up to `limit` rows starting at `offset`, in primary key order.
    async fn read_batch(&self, table: &Table, offset: u64, limit: usize) -> Result<Vec<Row>>;

    /// Execute a comparison query.
    async fn execute_query(&self, query: &DataQuery) -> Result<QueryResult>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Store name for logging.
    fn name(&self) -> &str;
}

/// Read/write access to the new schema.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Whether the table exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Create a table from legacy metadata.
    async fn create_table(&self, table: &Table) -> Result<()>;

    /// Delete all rows, returning how many were removed.
    async fn clear_table(&self, table: &str) -> Result<u64>;

    /// Insert a batch.
    ///
    /// With `transactional` set the batch commits as a unit: any row
    /// failure rolls the whole batch back and surfaces as `Err`. Without it
    /// rows are written one at a time and rejections are reported in the
    /// returned [`WriteOutcome`].
    async fn write_batch(&self, table: &Table, rows: &[Row], transactional: bool)
        -> Result<WriteOutcome>;

    /// Execute a comparison query.
    async fn execute_query(&self, query: &DataQuery) -> Result<QueryResult>;

    /// Count rows in a table.
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Store name for logging.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_truncates_long_sql() {
        let sql = format!("SELECT {} FROM t", "a, ".repeat(40));
        let label = DataQuery::Sql(sql).describe();
        assert!(label.ends_with("..."));
        assert_eq!(label.chars().count(), 63);
    }

    #[test]
    fn test_describe_table_scan() {
        let q = DataQuery::TableScan {
            table: "Users".into(),
            order_by: vec!["id".into()],
        };
        assert_eq!(q.describe(), "scan Users");
    }
}
