//! Data store drivers.
//!
//! - [`memory`]: in-process store for demo runs and tests
//! - [`postgres`]: pooled PostgreSQL store
//!
//! Both implement [`LegacySource`] and [`TargetStore`]; the factory
//! functions below pick one from the service configuration.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::sync::Arc;

use tracing::info;

use crate::config::{DataSourceConfig, StoreKind};
use crate::core::{LegacySource, TargetStore};
use crate::error::Result;

/// Open a memory store, loading its fixture when one is configured.
fn open_memory(config: &DataSourceConfig, name: &str) -> Result<MemoryStore> {
    match &config.fixture {
        Some(path) => {
            info!("Loading {} fixture from {}", name, path.display());
            MemoryStore::from_fixture(name, path)
        }
        None => Ok(MemoryStore::new(name)),
    }
}

/// Connect to the legacy source described by `config`.
pub async fn connect_legacy(config: &DataSourceConfig) -> Result<Arc<dyn LegacySource>> {
    Ok(match config.r#type {
        StoreKind::Postgres => Arc::new(PgStore::connect(config, "legacy").await?),
        StoreKind::Memory => Arc::new(open_memory(config, "legacy")?),
    })
}

/// Connect to the target store described by `config`.
pub async fn connect_target(config: &DataSourceConfig) -> Result<Arc<dyn TargetStore>> {
    Ok(match config.r#type {
        StoreKind::Postgres => Arc::new(PgStore::connect(config, "target").await?),
        StoreKind::Memory => Arc::new(open_memory(config, "target")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_without_fixture_is_empty() {
        let legacy = connect_legacy(&DataSourceConfig::memory(None)).await.unwrap();
        assert!(legacy.list_tables().await.unwrap().is_empty());
        assert_eq!(legacy.name(), "legacy");
    }

    #[tokio::test]
    async fn test_missing_fixture_is_io_error() {
        let config = DataSourceConfig::memory(Some("/nonexistent/fixture.json".into()));
        let err = match connect_target(&config).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert_eq!(err.exit_code(), crate::error::EXIT_IO_ERROR);
    }
}
