//! Service configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

use super::options::MigrationOptions;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len().max(1);

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy data source (read-only).
    pub legacy: DataSourceConfig,

    /// Target data store (seeded and validated).
    pub target: DataSourceConfig,

    /// Run history persistence.
    #[serde(default)]
    pub history: HistoryConfig,

    /// HTTP control surface.
    #[serde(default)]
    pub server: ServerConfig,

    /// Default run options. Auto-tuned when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationOptions>,

    /// Named comparison queries for the validation phase.
    #[serde(default)]
    pub queries: Vec<QueryConfig>,

    /// Project roots scanned by the auth removal phase.
    #[serde(default)]
    pub auth_removal: AuthRemovalConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in the run options when the config file did not set them.
    pub fn with_auto_tuning(mut self) -> Self {
        if self.migration.is_none() {
            let resources = SystemResources::detect();
            resources.log();

            // Workers: cores - 2, but at least 2 and at most 8
            let workers = resources.cpu_cores.saturating_sub(2).clamp(2, 8);
            info!("Auto-tuned config: maxConcurrentOperations={}", workers);

            self.migration = Some(MigrationOptions {
                max_concurrent_operations: workers,
                ..MigrationOptions::default()
            });
        }
        self
    }

    /// Effective default run options.
    pub fn default_options(&self) -> MigrationOptions {
        self.migration.clone().unwrap_or_default()
    }
}

/// Kind of data store behind a source or target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// PostgreSQL via a connection pool.
    #[default]
    Postgres,
    /// In-memory store, optionally loaded from a JSON fixture.
    Memory,
}

/// Data store connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Store kind (default: postgres).
    #[serde(default)]
    pub r#type: StoreKind,

    /// Database host.
    #[serde(default)]
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema holding the migrated tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "prefer").
    #[serde(default = "default_prefer")]
    pub ssl_mode: String,

    /// Maximum pooled connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// JSON fixture loaded into a memory store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture: Option<PathBuf>,
}

impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .field("fixture", &self.fixture)
            .finish()
    }
}

impl DataSourceConfig {
    /// Memory store settings, optionally backed by a fixture file.
    pub fn memory(fixture: Option<PathBuf>) -> Self {
        Self {
            r#type: StoreKind::Memory,
            host: String::new(),
            port: default_pg_port(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
            schema: default_public_schema(),
            ssl_mode: default_prefer(),
            max_connections: None,
            fixture,
        }
    }

    /// Effective pool size.
    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(8)
    }
}

/// Where run history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistoryBackendKind {
    /// One signed JSON file per run.
    #[default]
    File,
    /// Tables in the target PostgreSQL database.
    Postgres,
    /// Process memory only.
    Memory,
}

/// Run history settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Backend kind (default: file).
    #[serde(default)]
    pub backend: HistoryBackendKind,

    /// Directory for the file backend (default: "migration-history").
    #[serde(default = "default_history_dir")]
    pub directory: PathBuf,

    /// HMAC key for history file integrity.
    #[serde(default = "default_integrity_key")]
    pub integrity_key: String,

    /// Seconds without a heartbeat after which a run lease counts as
    /// abandoned (default: 60).
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl fmt::Debug for HistoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryConfig")
            .field("backend", &self.backend)
            .field("directory", &self.directory)
            .field("integrity_key", &"[REDACTED]")
            .field("lease_ttl_secs", &self.lease_ttl_secs)
            .finish()
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackendKind::default(),
            directory: default_history_dir(),
            integrity_key: default_integrity_key(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: "127.0.0.1:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// A named pair of comparison queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Query name, used in reports and include/exclude filters.
    pub name: String,

    /// SQL run against the legacy source.
    pub legacy_sql: String,

    /// SQL run against the target. Defaults to `legacy_sql`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_sql: Option<String>,

    /// Columns identifying a row. Empty means positional comparison.
    #[serde(default)]
    pub key_columns: Vec<String>,

    /// Mismatches on this query are listed as critical issues.
    #[serde(default)]
    pub critical: bool,
}

/// Project roots for the auth removal phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthRemovalConfig {
    /// API project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_root: Option<PathBuf>,

    /// Frontend project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_root: Option<PathBuf>,

    /// Documentation root for the removal notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_root: Option<PathBuf>,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_prefer() -> String {
    "prefer".to_string()
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("migration-history")
}

fn default_integrity_key() -> String {
    "legacy-migrate-history".to_string()
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
