//! In-memory data store.
//!
//! Implements both store traits over process memory. It backs demo runs
//! (loaded from a JSON fixture) and the test suites, so it carries a few
//! fault-injection knobs: artificial latency, an offline switch, per-table
//! row rejection rules and canned query results or failures.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::core::{
    Column, ColumnType, DataQuery, LegacySource, QueryResult, Row, SqlValue, Table, TargetStore,
    WriteOutcome,
};
use crate::error::{MigrateError, Result};

type RowPredicate = Arc<dyn Fn(&[SqlValue]) -> bool + Send + Sync>;

struct MemTable {
    table: Table,
    rows: Vec<Row>,
}

/// In-memory implementation of [`LegacySource`] and [`TargetStore`].
pub struct MemoryStore {
    name: String,
    tables: RwLock<BTreeMap<String, MemTable>>,
    canned: RwLock<HashMap<String, std::result::Result<QueryResult, String>>>,
    write_faults: RwLock<HashMap<String, RowPredicate>>,
    read_latency: Duration,
    write_latency: Duration,
    offline: AtomicBool,
    batches_written: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(BTreeMap::new()),
            canned: RwLock::new(HashMap::new()),
            write_faults: RwLock::new(HashMap::new()),
            read_latency: Duration::ZERO,
            write_latency: Duration::ZERO,
            offline: AtomicBool::new(false),
            batches_written: AtomicU64::new(0),
        }
    }

    /// Delay every read and query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.read_latency = latency;
        self
    }

    /// Delay every batch write by `latency` before it commits.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    /// Load a store from a JSON fixture file.
    pub fn from_fixture<P: AsRef<Path>>(name: impl Into<String>, path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_fixture_str(name, &content)
    }

    /// Load a store from fixture JSON.
    ///
    /// ```json
    /// {"tables": [{"name": "Users", "columns": [{"name": "id", "type": "int"}],
    ///              "primaryKey": ["id"], "rows": [[1]]}],
    ///  "queries": [{"sql": "SELECT 1", "columns": ["x"], "rows": [[1]]}]}
    /// ```
    pub fn from_fixture_str(name: impl Into<String>, json: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(json)?;
        let store = Self::new(name);

        for t in fixture.tables {
            let table = Table {
                name: t.name,
                columns: t.columns,
                primary_key: t.primary_key,
                row_count: 0,
            };
            let rows = t
                .rows
                .iter()
                .map(|raw| coerce_row(&table.columns, raw))
                .collect::<Result<Vec<_>>>()?;
            store.insert_table(table, rows);
        }
        for q in fixture.queries {
            let rows = q
                .rows
                .iter()
                .map(|r| r.iter().map(SqlValue::from_json).collect())
                .collect();
            store.register_query(&q.sql, QueryResult::new(q.columns, rows));
        }
        Ok(store)
    }

    /// Create (or replace) a table with its rows.
    pub fn insert_table(&self, table: Table, rows: Vec<Row>) {
        self.tables
            .write()
            .insert(key(&table.name), MemTable { table, rows });
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(&key(table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Return a fixed result for an exact SQL text.
    pub fn register_query(&self, sql: &str, result: QueryResult) {
        self.canned.write().insert(normalize_sql(sql), Ok(result));
    }

    /// Make an exact SQL text fail with a statement error.
    pub fn fail_query(&self, sql: &str, message: &str) {
        self.canned
            .write()
            .insert(normalize_sql(sql), Err(message.to_string()));
    }

    /// Reject rows matching `predicate` when written to `table`.
    pub fn fail_rows_where<F>(&self, table: &str, predicate: F)
    where
        F: Fn(&[SqlValue]) -> bool + Send + Sync + 'static,
    {
        self.write_faults.write().insert(key(table), Arc::new(predicate));
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Number of batch writes that committed at least one row.
    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(AtomicOrdering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(MigrateError::Connection(format!(
                "{}: connection refused",
                self.name
            )));
        }
        Ok(())
    }

    async fn delay(&self, latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn run_query(&self, query: &DataQuery) -> Result<QueryResult> {
        match query {
            DataQuery::TableScan { table, order_by } => {
                let tables = self.tables.read();
                let mem = tables
                    .get(&key(table))
                    .ok_or_else(|| MigrateError::Query(format!("relation \"{}\" does not exist", table)))?;
                let mut rows = mem.rows.clone();
                let order: Vec<usize> = order_by
                    .iter()
                    .filter_map(|c| mem.table.column_index(c))
                    .collect();
                if !order.is_empty() {
                    rows.sort_by(|a, b| {
                        order
                            .iter()
                            .map(|&i| compare_values(&a[i], &b[i]))
                            .find(|o| *o != Ordering::Equal)
                            .unwrap_or(Ordering::Equal)
                    });
                }
                Ok(QueryResult::new(mem.table.column_names(), rows))
            }
            DataQuery::Sql(sql) => {
                let normalized = normalize_sql(sql);
                if let Some(canned) = self.canned.read().get(&normalized) {
                    return canned.clone().map_err(MigrateError::Query);
                }
                self.run_simple_select(&normalized)
            }
        }
    }

    /// Supports `SELECT * FROM t` and `SELECT COUNT(*) FROM t`.
    fn run_simple_select(&self, sql: &str) -> Result<QueryResult> {
        let lower = sql.to_lowercase();
        let table = |prefix: &str| {
            lower
                .strip_prefix(prefix)
                .map(|rest| rest.trim().trim_end_matches(';').trim().trim_matches('"').to_string())
        };
        if let Some(name) = table("select count(*) from ") {
            let tables = self.tables.read();
            let mem = tables
                .get(&name)
                .ok_or_else(|| MigrateError::Query(format!("relation \"{}\" does not exist", name)))?;
            return Ok(QueryResult::new(
                vec!["count".into()],
                vec![vec![SqlValue::Int(mem.rows.len() as i64)]],
            ));
        }
        if let Some(name) = table("select * from ") {
            let order_by = self
                .tables
                .read()
                .get(&name)
                .map(|t| t.table.primary_key.clone())
                .unwrap_or_default();
            return self.run_query(&DataQuery::TableScan {
                table: name,
                order_by,
            });
        }
        Err(MigrateError::Query(format!(
            "{}: unsupported statement: {}",
            self.name, sql
        )))
    }
}

#[async_trait]
impl LegacySource for MemoryStore {
    async fn list_tables(&self) -> Result<Vec<Table>> {
        self.check_online()?;
        Ok(self
            .tables
            .read()
            .values()
            .map(|t| Table {
                row_count: t.rows.len() as u64,
                ..t.table.clone()
            })
            .collect())
    }

    async fn read_batch(&self, table: &Table, offset: u64, limit: usize) -> Result<Vec<Row>> {
        self.check_online()?;
        self.delay(self.read_latency).await;
        let tables = self.tables.read();
        let mem = tables
            .get(&key(&table.name))
            .ok_or_else(|| MigrateError::Query(format!("relation \"{}\" does not exist", table.name)))?;
        let start = (offset as usize).min(mem.rows.len());
        let end = start.saturating_add(limit).min(mem.rows.len());
        Ok(mem.rows[start..end].to_vec())
    }

    async fn execute_query(&self, query: &DataQuery) -> Result<QueryResult> {
        self.check_online()?;
        self.delay(self.read_latency).await;
        self.run_query(query)
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.tables.read().contains_key(&key(table)))
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        self.check_online()?;
        let mut tables = self.tables.write();
        if tables.contains_key(&key(&table.name)) {
            return Err(MigrateError::Query(format!(
                "relation \"{}\" already exists",
                table.name
            )));
        }
        tables.insert(
            key(&table.name),
            MemTable {
                table: Table {
                    row_count: 0,
                    ..table.clone()
                },
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn clear_table(&self, table: &str) -> Result<u64> {
        self.check_online()?;
        let mut tables = self.tables.write();
        let mem = tables
            .get_mut(&key(table))
            .ok_or_else(|| MigrateError::Query(format!("relation \"{}\" does not exist", table)))?;
        let removed = mem.rows.len() as u64;
        mem.rows.clear();
        Ok(removed)
    }

    async fn write_batch(
        &self,
        table: &Table,
        rows: &[Row],
        transactional: bool,
    ) -> Result<WriteOutcome> {
        self.check_online()?;
        self.delay(self.write_latency).await;

        let fault = self.write_faults.read().get(&key(&table.name)).cloned();
        let mut tables = self.tables.write();
        let mem = tables
            .get_mut(&key(&table.name))
            .ok_or_else(|| MigrateError::Query(format!("relation \"{}\" does not exist", table.name)))?;

        let pk = mem.table.pk_indexes();
        let mut seen: HashSet<String> = if pk.is_empty() {
            HashSet::new()
        } else {
            mem.rows.iter().map(|r| pk_key(r, &pk)).collect()
        };

        let mut outcome = WriteOutcome::default();
        let mut accepted = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let rejection = mem
                .table
                .check_row(row)
                .or_else(|| {
                    fault
                        .as_ref()
                        .filter(|f| f(row))
                        .map(|_| "rejected by constraint".to_string())
                })
                .or_else(|| {
                    (!pk.is_empty() && !seen.insert(pk_key(row, &pk)))
                        .then(|| "duplicate key value violates primary key".to_string())
                });

            match rejection {
                Some(reason) if transactional => {
                    debug!("{}: batch on {} rolled back at row {}", self.name, table.name, i);
                    return Err(MigrateError::Query(format!("row {}: {}", i, reason)));
                }
                Some(reason) => outcome.failed.push((i, reason)),
                None => accepted.push(row.clone()),
            }
        }

        outcome.written = accepted.len() as u64;
        if !accepted.is_empty() {
            mem.rows.extend(accepted);
            self.batches_written.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Ok(outcome)
    }

    async fn execute_query(&self, query: &DataQuery) -> Result<QueryResult> {
        self.check_online()?;
        self.delay(self.read_latency).await;
        self.run_query(query)
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.check_online()?;
        self.tables
            .read()
            .get(&key(table))
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| MigrateError::Query(format!("relation \"{}\" does not exist", table)))
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn key(name: &str) -> String {
    name.to_lowercase()
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn pk_key(row: &[SqlValue], pk: &[usize]) -> String {
    pk.iter()
        .map(|&i| row.get(i).map(|v| v.to_string()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Total order used for table scans: NULLs first, numbers numerically.
fn compare_values(a: &SqlValue, b: &SqlValue) -> Ordering {
    fn num(v: &SqlValue) -> Option<f64> {
        match v {
            SqlValue::Int(i) => Some(*i as f64),
            SqlValue::Float(f) => Some(*f),
            SqlValue::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }
    match (a, b) {
        (SqlValue::Null, SqlValue::Null) => Ordering::Equal,
        (SqlValue::Null, _) => Ordering::Less,
        (_, SqlValue::Null) => Ordering::Greater,
        _ => match (num(a), num(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[derive(Deserialize)]
struct Fixture {
    #[serde(default)]
    tables: Vec<FixtureTable>,
    #[serde(default)]
    queries: Vec<FixtureQuery>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureTable {
    name: String,
    columns: Vec<Column>,
    #[serde(default)]
    primary_key: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct FixtureQuery {
    sql: String,
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

fn coerce_row(columns: &[Column], raw: &[serde_json::Value]) -> Result<Row> {
    if raw.len() != columns.len() {
        return Err(MigrateError::Config(format!(
            "fixture row has {} values, expected {}",
            raw.len(),
            columns.len()
        )));
    }
    Ok(columns
        .iter()
        .zip(raw)
        .map(|(c, v)| coerce(c.data_type, v))
        .collect())
}

/// Convert a JSON fixture value to the column's type where it parses,
/// otherwise keep the plain JSON conversion (so bad fixture rows can be
/// used to exercise row validation).
fn coerce(ty: ColumnType, value: &serde_json::Value) -> SqlValue {
    let plain = SqlValue::from_json(value);
    match (ty, &plain) {
        (ColumnType::Float, SqlValue::Int(i)) => SqlValue::Float(*i as f64),
        (ColumnType::Decimal, SqlValue::Int(i)) => SqlValue::Decimal(Decimal::from(*i)),
        (ColumnType::Decimal, SqlValue::Float(f)) => Decimal::try_from(*f)
            .map(SqlValue::Decimal)
            .unwrap_or_else(|_| plain.clone()),
        (_, SqlValue::Text(text)) => parse_text(ty, text).unwrap_or_else(|| plain.clone()),
        _ => plain.clone(),
    }
}

fn parse_text(ty: ColumnType, text: &str) -> Option<SqlValue> {
    match ty {
        ColumnType::DateTime => NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(SqlValue::DateTime),
        ColumnType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(SqlValue::Date),
        ColumnType::Decimal => text.parse::<Decimal>().ok().map(SqlValue::Decimal),
        ColumnType::Uuid => text.parse::<uuid::Uuid>().ok().map(SqlValue::Uuid),
        ColumnType::Bytes => hex::decode(text.trim_start_matches("0x"))
            .ok()
            .map(SqlValue::Bytes),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Table {
        Table::new(
            "Users",
            vec![
                Column::new("id", ColumnType::Int).not_null(),
                Column::new("name", ColumnType::Text),
            ],
        )
        .with_primary_key(&["id"])
    }

    fn row(id: i64, name: &str) -> Row {
        vec![SqlValue::Int(id), SqlValue::from(name)]
    }

    #[tokio::test]
    async fn test_read_batches() {
        let store = MemoryStore::new("legacy");
        store.insert_table(users(), (1..=5).map(|i| row(i, "u")).collect());

        let tables = LegacySource::list_tables(&store).await.unwrap();
        assert_eq!(tables[0].row_count, 5);

        let batch = store.read_batch(&users(), 3, 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(store.read_batch(&users(), 10, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transactional_write_rolls_back_batch() {
        let store = MemoryStore::new("target");
        store.create_table(&users()).await.unwrap();

        let rows = vec![row(1, "a"), vec![SqlValue::Null, SqlValue::from("b")], row(3, "c")];
        assert!(store.write_batch(&users(), &rows, true).await.is_err());
        assert!(store.rows("users").is_empty());

        let outcome = store.write_batch(&users(), &rows, false).await.unwrap();
        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, 1);
        assert_eq!(store.rows("Users").len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_primary_key_rejected() {
        let store = MemoryStore::new("target");
        store.create_table(&users()).await.unwrap();
        store.write_batch(&users(), &[row(1, "a")], true).await.unwrap();
        assert!(store.write_batch(&users(), &[row(1, "b")], true).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection_and_offline() {
        let store = MemoryStore::new("target");
        store.create_table(&users()).await.unwrap();
        store.fail_rows_where("users", |r| r[0] == SqlValue::Int(2));
        let outcome = store
            .write_batch(&users(), &[row(1, "a"), row(2, "b")], false)
            .await
            .unwrap();
        assert_eq!(outcome.written, 1);

        store.set_offline(true);
        let err = TargetStore::ping(&store).await.unwrap_err();
        assert!(err.is_connection_failure());
    }

    #[tokio::test]
    async fn test_queries() {
        let store = MemoryStore::new("legacy");
        store.insert_table(users(), vec![row(2, "b"), row(1, "a")]);
        store.register_query("SELECT 42", QueryResult::new(vec!["x".into()], vec![vec![SqlValue::Int(42)]]));
        store.fail_query("SELECT broken", "syntax error");

        let scan = LegacySource::execute_query(&store, &DataQuery::Sql("select * from users".into()))
            .await
            .unwrap();
        assert_eq!(scan.rows[0][0], SqlValue::Int(1));

        let count = LegacySource::execute_query(&store, &DataQuery::Sql("SELECT COUNT(*) FROM users".into()))
            .await
            .unwrap();
        assert_eq!(count.rows[0][0], SqlValue::Int(2));

        let canned = LegacySource::execute_query(&store, &DataQuery::Sql("SELECT   42".into()))
            .await
            .unwrap();
        assert_eq!(canned.rows[0][0], SqlValue::Int(42));

        let err = LegacySource::execute_query(&store, &DataQuery::Sql("SELECT broken".into()))
            .await
            .unwrap_err();
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn test_fixture_coercion() {
        let json = r#"{
            "tables": [{
                "name": "Samples",
                "columns": [
                    {"name": "id", "type": "int", "nullable": false},
                    {"name": "taken", "type": "datetime"},
                    {"name": "result", "type": "decimal"}
                ],
                "primaryKey": ["id"],
                "rows": [[1, "2024-03-01T10:00:00", "12.50"], [2, null, 3]]
            }]
        }"#;
        let store = MemoryStore::from_fixture_str("legacy", json).unwrap();
        let rows = store.rows("samples");
        assert!(matches!(rows[0][1], SqlValue::DateTime(_)));
        assert_eq!(rows[0][2], SqlValue::Decimal("12.50".parse().unwrap()));
        assert_eq!(rows[1][2], SqlValue::Decimal(Decimal::from(3)));
    }

    #[test]
    fn test_fixture_row_arity_checked() {
        let json = r#"{"tables": [{"name": "T", "columns": [{"name": "id", "type": "int"}], "rows": [[1, 2]]}]}"#;
        assert!(MemoryStore::from_fixture_str("legacy", json).is_err());
    }
}
