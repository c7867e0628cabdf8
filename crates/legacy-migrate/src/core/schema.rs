//! Table and column metadata shared by the seeder, the validator and the drivers.

use serde::{Deserialize, Serialize};

use super::value::SqlValue;

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Decimal,
    Text,
    Bytes,
    Uuid,
    #[serde(alias = "datetime", alias = "timestamp")]
    DateTime,
    Date,
}

impl ColumnType {
    /// Whether a non-null value can be stored in a column of this type.
    pub fn accepts(&self, value: &SqlValue) -> bool {
        match (self, value) {
            (_, SqlValue::Null) => true,
            (ColumnType::Bool, SqlValue::Bool(_)) => true,
            (ColumnType::Int, SqlValue::Int(_)) => true,
            (ColumnType::Float, SqlValue::Float(_) | SqlValue::Int(_)) => true,
            (ColumnType::Decimal, SqlValue::Decimal(_) | SqlValue::Int(_)) => true,
            (ColumnType::Text, SqlValue::Text(_)) => true,
            (ColumnType::Bytes, SqlValue::Bytes(_)) => true,
            (ColumnType::Uuid, SqlValue::Uuid(_)) => true,
            (ColumnType::DateTime, SqlValue::DateTime(_)) => true,
            (ColumnType::Date, SqlValue::Date(_)) => true,
            _ => false,
        }
    }

    /// PostgreSQL DDL type name.
    pub fn pg_type(&self) -> &'static str {
        match self {
            ColumnType::Bool => "boolean",
            ColumnType::Int => "bigint",
            ColumnType::Float => "double precision",
            ColumnType::Decimal => "numeric",
            ColumnType::Text => "text",
            ColumnType::Bytes => "bytea",
            ColumnType::Uuid => "uuid",
            ColumnType::DateTime => "timestamp",
            ColumnType::Date => "date",
        }
    }

    /// Map a PostgreSQL `information_schema` data type to a logical type.
    pub fn from_pg(data_type: &str) -> Self {
        match data_type.to_lowercase().as_str() {
            "boolean" => ColumnType::Bool,
            "smallint" | "integer" | "bigint" => ColumnType::Int,
            "real" | "double precision" => ColumnType::Float,
            "numeric" | "decimal" | "money" => ColumnType::Decimal,
            "bytea" => ColumnType::Bytes,
            "uuid" => ColumnType::Uuid,
            "timestamp without time zone" | "timestamp with time zone" | "timestamp" => {
                ColumnType::DateTime
            }
            "date" => ColumnType::Date,
            _ => ColumnType::Text,
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Logical type.
    #[serde(rename = "type")]
    pub data_type: ColumnType,

    /// Whether NULL is allowed.
    #[serde(default = "default_nullable")]
    pub nullable: bool,

    /// Maximum character length for text columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    /// Create a nullable column.
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            max_length: None,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set a maximum text length.
    pub fn with_max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Table name.
    pub name: String,

    /// Column definitions in storage order.
    pub columns: Vec<Column>,

    /// Primary key column names.
    #[serde(default)]
    pub primary_key: Vec<String>,

    /// Row count at discovery time.
    #[serde(default)]
    pub row_count: u64,
}

impl Table {
    /// Create a table with no rows counted yet.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            row_count: 0,
        }
    }

    /// Set the primary key columns.
    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Column names in storage order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Position of a column by case-insensitive name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Positions of the primary key columns.
    pub fn pk_indexes(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|pk| self.column_index(pk))
            .collect()
    }

    /// Check one row against the column definitions.
    ///
    /// Returns a description of the first violation found.
    pub fn check_row(&self, row: &[SqlValue]) -> Option<String> {
        if row.len() != self.columns.len() {
            return Some(format!(
                "expected {} columns, got {}",
                self.columns.len(),
                row.len()
            ));
        }
        for (column, value) in self.columns.iter().zip(row) {
            if value.is_null() && !column.nullable {
                return Some(format!("column {} does not allow NULL", column.name));
            }
            if !column.data_type.accepts(value) {
                return Some(format!(
                    "column {} expects {:?}, got {}",
                    column.name,
                    column.data_type,
                    value.type_name()
                ));
            }
            if let (Some(max), SqlValue::Text(s)) = (column.max_length, value) {
                if s.chars().count() > max {
                    return Some(format!(
                        "column {} exceeds maximum length {}",
                        column.name, max
                    ));
                }
            }
        }
        None
    }
}
