//! Core abstractions shared across the migration phases.
//!
//! - [`schema`]: table and column metadata
//! - [`value`]: SQL value representation and result sets
//! - [`traits`]: the legacy-source and target-store contracts
//!
//! Drivers (`drivers/memory`, `drivers/postgres`) implement the traits;
//! the seeder, validator and orchestrator only ever see the traits.

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{Column, ColumnType, Table};
pub use traits::{DataQuery, LegacySource, TargetStore};
pub use value::{QueryResult, Row, SqlValue, WriteOutcome};
