//! PostgreSQL data store.
//!
//! Uses deadpool-postgres for connection pooling. Comparison queries go
//! through the simple query protocol, so every value comes back as text;
//! the validator's tolerant comparison handles the numeric and timestamp
//! cases. Batch inserts are built as literal multi-row INSERT statements.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use tokio_postgres::{Config as PgConfig, NoTls, SimpleQueryMessage};
use tracing::{debug, info};

use crate::config::DataSourceConfig;
use crate::core::{
    Column, ColumnType, DataQuery, LegacySource, QueryResult, Row, SqlValue, Table, TargetStore,
    WriteOutcome,
};
use crate::error::{MigrateError, Result};

/// PostgreSQL implementation of [`LegacySource`] and [`TargetStore`].
pub struct PgStore {
    pool: Pool,
    schema: String,
    name: String,
}

impl PgStore {
    /// Connect using service configuration.
    pub async fn connect(config: &DataSourceConfig, name: &str) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        let store = Self::with_config(pg_config, &config.schema, config.get_max_connections(), name)
            .await?;
        info!(
            "Connected to PostgreSQL ({}): {}:{}/{}",
            name, config.host, config.port, config.database
        );
        Ok(store)
    }

    /// Connect using a libpq-style connection string.
    pub async fn from_connection_string(conn_str: &str, schema: &str, name: &str) -> Result<Self> {
        let pg_config: PgConfig = conn_str
            .parse()
            .map_err(|e| MigrateError::Config(format!("invalid connection string: {}", e)))?;
        Self::with_config(pg_config, schema, 4, name).await
    }

    async fn with_config(pg_config: PgConfig, schema: &str, max_conns: usize, name: &str) -> Result<Self> {
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| MigrateError::pool(e.to_string(), format!("creating {} pool", name)))?;

        let store = Self {
            pool,
            schema: schema.to_string(),
            name: name.to_string(),
        };

        // Test connection
        store.ping_inner().await?;
        Ok(store)
    }

    /// Underlying pool, shared with the history store.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::Connection(format!("{}: {}", self.name, e)))
    }

    async fn ping_inner(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.map_err(classify)?;
        Ok(())
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    async fn simple(&self, sql: &str) -> Result<QueryResult> {
        let client = self.client().await?;
        let messages = client.simple_query(sql).await.map_err(classify)?;

        let mut result = QueryResult::default();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let values = (0..row.len())
                    .map(|i| match row.get(i) {
                        Some(text) => SqlValue::Text(text.to_string()),
                        None => SqlValue::Null,
                    })
                    .collect();
                result.rows.push(values);
            }
        }
        Ok(result)
    }

    fn build_select(&self, table: &str, order_by: &[String]) -> String {
        let mut sql = format!("SELECT * FROM {}", self.qualified(table));
        if !order_by.is_empty() {
            let cols: Vec<String> = order_by.iter().map(|c| quote_ident(c)).collect();
            sql.push_str(&format!(" ORDER BY {}", cols.join(", ")));
        }
        sql
    }

    fn to_query_sql(&self, query: &DataQuery) -> String {
        match query {
            DataQuery::TableScan { table, order_by } => self.build_select(table, order_by),
            DataQuery::Sql(sql) => sql.clone(),
        }
    }

    fn build_insert(&self, table: &Table, rows: &[Row]) -> String {
        let cols: Vec<String> = table.columns.iter().map(|c| quote_ident(&c.name)).collect();
        let values: Vec<String> = rows
            .iter()
            .map(|row| {
                let literals: Vec<String> = row.iter().map(SqlValue::to_sql_literal).collect();
                format!("({})", literals.join(", "))
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.qualified(&table.name),
            cols.join(", "),
            values.join(",\n")
        )
    }
}

#[async_trait]
impl LegacySource for PgStore {
    async fn list_tables(&self) -> Result<Vec<Table>> {
        let client = self.client().await?;
        let table_rows = client
            .query(
                "SELECT table_name FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[&self.schema],
            )
            .await
            .map_err(classify)?;

        let mut tables = Vec::with_capacity(table_rows.len());
        for row in table_rows {
            let name: String = row.get(0);

            let columns = client
                .query(
                    "SELECT column_name, data_type, is_nullable, character_maximum_length
                     FROM information_schema.columns
                     WHERE table_schema = $1 AND table_name = $2
                     ORDER BY ordinal_position",
                    &[&self.schema, &name],
                )
                .await
                .map_err(classify)?
                .into_iter()
                .map(|c| {
                    let data_type: String = c.get(1);
                    let nullable: String = c.get(2);
                    let max_length: Option<i32> = c.get(3);
                    Column {
                        name: c.get(0),
                        data_type: ColumnType::from_pg(&data_type),
                        nullable: nullable == "YES",
                        max_length: max_length.map(|l| l as usize),
                    }
                })
                .collect();

            let primary_key = client
                .query(
                    "SELECT kcu.column_name
                     FROM information_schema.table_constraints tc
                     JOIN information_schema.key_column_usage kcu
                       ON tc.constraint_name = kcu.constraint_name
                      AND tc.table_schema = kcu.table_schema
                     WHERE tc.constraint_type = 'PRIMARY KEY'
                       AND tc.table_schema = $1 AND tc.table_name = $2
                     ORDER BY kcu.ordinal_position",
                    &[&self.schema, &name],
                )
                .await
                .map_err(classify)?
                .into_iter()
                .map(|r| r.get(0))
                .collect();

            let count_sql = format!("SELECT COUNT(*) FROM {}", self.qualified(&name));
            let count: i64 = client
                .query_one(count_sql.as_str(), &[])
                .await
                .map_err(classify)?
                .get(0);

            tables.push(Table {
                name,
                columns,
                primary_key,
                row_count: count.max(0) as u64,
            });
        }

        debug!("{}: found {} tables in schema {}", self.name, tables.len(), self.schema);
        Ok(tables)
    }

    async fn read_batch(&self, table: &Table, offset: u64, limit: usize) -> Result<Vec<Row>> {
        let order = if table.primary_key.is_empty() {
            table.column_names()
        } else {
            table.primary_key.clone()
        };
        let sql = format!(
            "{} LIMIT {} OFFSET {}",
            self.build_select(&table.name, &order),
            limit,
            offset
        );
        let result = self.simple(&sql).await?;
        Ok(result
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&table.columns)
                    .map(|(v, c)| parse_typed(v, c.data_type))
                    .collect()
            })
            .collect())
    }

    async fn execute_query(&self, query: &DataQuery) -> Result<QueryResult> {
        self.simple(&self.to_query_sql(query)).await
    }

    async fn ping(&self) -> Result<()> {
        self.ping_inner().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables
                                WHERE table_schema = $1 AND table_name = $2)",
                &[&self.schema, &table],
            )
            .await
            .map_err(classify)?;
        Ok(row.get(0))
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        let mut ddl = format!("CREATE TABLE {} (\n", self.qualified(&table.name));
        let defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable { "" } else { " NOT NULL" };
                let ty = match (c.data_type, c.max_length) {
                    (ColumnType::Text, Some(len)) => format!("varchar({})", len),
                    (ty, _) => ty.pg_type().to_string(),
                };
                format!("    {} {}{}", quote_ident(&c.name), ty, null)
            })
            .collect();
        ddl.push_str(&defs.join(",\n"));
        if !table.primary_key.is_empty() {
            let pk: Vec<String> = table.primary_key.iter().map(|c| quote_ident(c)).collect();
            ddl.push_str(&format!(",\n    PRIMARY KEY ({})", pk.join(", ")));
        }
        ddl.push_str("\n)");

        let client = self.client().await?;
        client.batch_execute(&ddl).await.map_err(classify)?;
        info!("{}: created table {}", self.name, table.name);
        Ok(())
    }

    async fn clear_table(&self, table: &str) -> Result<u64> {
        let client = self.client().await?;
        let removed = client
            .execute(format!("DELETE FROM {}", self.qualified(table)).as_str(), &[])
            .await
            .map_err(classify)?;
        Ok(removed)
    }

    async fn write_batch(
        &self,
        table: &Table,
        rows: &[Row],
        transactional: bool,
    ) -> Result<WriteOutcome> {
        if rows.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let mut client = self.client().await?;

        if transactional {
            let tx = client.transaction().await.map_err(classify)?;
            tx.batch_execute(&self.build_insert(table, rows))
                .await
                .map_err(classify)?;
            tx.commit().await.map_err(classify)?;
            return Ok(WriteOutcome {
                written: rows.len() as u64,
                failed: Vec::new(),
            });
        }

        let mut outcome = WriteOutcome::default();
        for (i, row) in rows.iter().enumerate() {
            let sql = self.build_insert(table, std::slice::from_ref(row));
            match client.batch_execute(&sql).await {
                Ok(()) => outcome.written += 1,
                Err(e) if e.is_closed() => return Err(classify(e)),
                Err(e) => outcome.failed.push((i, e.to_string())),
            }
        }
        Ok(outcome)
    }

    async fn execute_query(&self, query: &DataQuery) -> Result<QueryResult> {
        self.simple(&self.to_query_sql(query)).await
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let client = self.client().await?;
        let count: i64 = client
            .query_one(format!("SELECT COUNT(*) FROM {}", self.qualified(table)).as_str(), &[])
            .await
            .map_err(classify)?
            .get(0);
        Ok(count.max(0) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.ping_inner().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Closed connections are connection failures; everything else is a
/// statement error.
fn classify(e: tokio_postgres::Error) -> MigrateError {
    if e.is_closed() {
        MigrateError::Connection(e.to_string())
    } else {
        MigrateError::Store(e)
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Parse a text value from the simple query protocol into the column type.
fn parse_typed(value: SqlValue, ty: ColumnType) -> SqlValue {
    let text = match &value {
        SqlValue::Text(t) => t.as_str(),
        _ => return value,
    };
    let parsed = match ty {
        ColumnType::Bool => match text {
            "t" | "true" => Some(SqlValue::Bool(true)),
            "f" | "false" => Some(SqlValue::Bool(false)),
            _ => None,
        },
        ColumnType::Int => text.parse().ok().map(SqlValue::Int),
        ColumnType::Float => text.parse().ok().map(SqlValue::Float),
        ColumnType::Decimal => text.parse::<Decimal>().ok().map(SqlValue::Decimal),
        ColumnType::Uuid => text.parse().ok().map(SqlValue::Uuid),
        ColumnType::DateTime => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(SqlValue::DateTime),
        ColumnType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(SqlValue::Date),
        ColumnType::Bytes => hex::decode(text.trim_start_matches("\\x"))
            .ok()
            .map(SqlValue::Bytes),
        ColumnType::Text => None,
    };
    parsed.unwrap_or(value)
}
