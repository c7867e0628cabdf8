//! # legacy-migrate
//!
//! Legacy-to-modern data migration orchestrator.
//!
//! A run moves through three phases, each enabled by its options:
//!
//! - **Seeding**: copy legacy tables into the target in bounded batches,
//!   optionally one transaction per batch
//! - **Validation**: run paired queries against both systems and diff the
//!   results and timings
//! - **Auth removal**: strip an authentication subsystem from the migrated
//!   API and frontend sources, with a verified backup and rollback
//!
//! One run is active at a time. Runs can be paused, resumed and cancelled
//! at batch, query and file boundaries, and every run is kept in a history
//! store for status polling, reports and statistics.
//!
//! ## Example
//!
//! ```rust,no_run
//! use legacy_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> legacy_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::from_config(&config, None).await?;
//!     let run = orchestrator.run_to_completion(config.default_options()).await?;
//!     println!("Migration {:?}: {} rows", run.status, run.statistics.processed_rows);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth_removal;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod history;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod seeder;
pub mod verify;

// Re-exports for convenient access
pub use auth_removal::{AuthRemovalPlanner, AuthRemovalResult, RollbackResult};
pub use config::{Config, MigrationOptions};
pub use error::{MigrateError, Result};
pub use history::{HistoryStore, MigrationRun, RunStatus};
pub use logging::{LogBuffer, RunLogLayer};
pub use orchestrator::{Orchestrator, RunContext, RunSettings};
pub use seeder::{BatchSeeder, SeedingResult};
pub use verify::{DifferentialValidator, ValidationResult};
