//! Migration run history.
//!
//! Run records are the source of truth for status polling of finished
//! runs, reports and statistics. The store also holds the lease that
//! keeps to one active run system-wide.

mod backend;
mod db;
mod file;
mod memory;
mod model;

pub use backend::{run_status_to_str, str_to_run_status, HistoryStore, Lease};
pub use db::PgHistoryStore;
pub use file::FileHistoryStore;
pub use memory::MemoryHistoryStore;
pub use model::{
    ErrorLevel, HistoryStatistics, MigrationError, MigrationRun, MigrationStatistics, Phase,
    RunStatus,
};

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, HistoryBackendKind};
use crate::drivers::PgStore;
use crate::error::Result;

/// Open and initialize the history store selected by `config.history`.
pub async fn open(config: &Config) -> Result<Arc<dyn HistoryStore>> {
    let store: Arc<dyn HistoryStore> = match config.history.backend {
        HistoryBackendKind::File => Arc::new(FileHistoryStore::new(
            &config.history.directory,
            &config.history.integrity_key,
        )),
        HistoryBackendKind::Postgres => {
            let pg = PgStore::connect(&config.target, "history").await?;
            Arc::new(PgHistoryStore::new(pg.pool()))
        }
        HistoryBackendKind::Memory => Arc::new(MemoryHistoryStore::new()),
    };
    store.init().await?;
    info!("History store: {}", store.backend_type());
    Ok(store)
}
