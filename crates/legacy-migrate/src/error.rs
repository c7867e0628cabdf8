//! Error types for the migration library.

use thiserror::Error;

/// Exit code for configuration and option errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for data store connection failures.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for a migration that ran but failed.
pub const EXIT_MIGRATION_FAILED: u8 = 3;
/// Exit code for run or unit timeouts.
pub const EXIT_TIMEOUT: u8 = 4;
/// Exit code for conflicting or out-of-order control requests.
pub const EXIT_CONFLICT: u8 = 5;
/// Exit code for unknown runs or backups.
pub const EXIT_NOT_FOUND: u8 = 6;
/// Exit code for filesystem errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code for history store errors.
pub const EXIT_HISTORY_ERROR: u8 = 8;
/// Exit code after SIGINT/SIGTERM cancellation.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Migration options are structurally invalid
    #[error("Invalid migration options: {0}")]
    Validation(String),

    /// Another migration already holds the active-run lease
    #[error("Migration {0} is already running")]
    Conflict(String),

    /// Control request not allowed in the run's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown migration, backup or report
    #[error("Not found: {0}")]
    NotFound(String),

    /// A single unit of work (batch, query, file) failed
    #[error("Operation failed for {unit}: {message}")]
    Operation { unit: String, message: String },

    /// Run-level failure that ends the current phase
    #[error("Fatal: {0}")]
    Fatal(String),

    /// A unit or the whole run exceeded its time budget
    #[error("Timed out after {seconds}s: {scope}")]
    Timeout { scope: String, seconds: u64 },

    /// Data store could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// Data store rejected a statement
    #[error("Query error: {0}")]
    Query(String),

    /// PostgreSQL driver error
    #[error("Database error: {0}")]
    Store(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Run history could not be read or written
    #[error("History store error: {0}")]
    History(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, API request, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create an Operation error
    pub fn operation(unit: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Operation {
            unit: unit.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(scope: impl Into<String>, seconds: u64) -> Self {
        MigrateError::Timeout {
            scope: scope.into(),
            seconds,
        }
    }

    /// True when the failure means the data store itself is unreachable,
    /// as opposed to a single statement being rejected.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            MigrateError::Connection(_) | MigrateError::Pool { .. } => true,
            MigrateError::Store(e) => e.is_closed(),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Validation(_) | MigrateError::Yaml(_) => {
                EXIT_CONFIG_ERROR
            }
            MigrateError::Connection(_) | MigrateError::Pool { .. } | MigrateError::Store(_) => {
                EXIT_CONNECTION_ERROR
            }
            MigrateError::Operation { .. } | MigrateError::Fatal(_) | MigrateError::Query(_) => {
                EXIT_MIGRATION_FAILED
            }
            MigrateError::Timeout { .. } => EXIT_TIMEOUT,
            MigrateError::Conflict(_) | MigrateError::InvalidState(_) => EXIT_CONFLICT,
            MigrateError::NotFound(_) => EXIT_NOT_FOUND,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::History(_) | MigrateError::Json(_) => EXIT_HISTORY_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
