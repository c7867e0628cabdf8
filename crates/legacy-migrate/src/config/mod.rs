//! Configuration loading and validation.

mod filter;
mod options;
mod types;
mod validation;

pub use filter::{find_overlap, NameFilter};
pub use options::{AuthRemovalOptions, MigrationOptions, SeedingOptions, ValidationOptions};
pub use types::*;
pub use validation::validate_options;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration, recorded with each run.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl MigrationOptions {
    /// Load run options from a YAML or JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

impl DataSourceConfig {
    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={}",
            self.host, self.port, self.database, self.user, self.password, self.ssl_mode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
legacy:
  type: memory
target:
  type: memory
queries:
  - name: active-samples
    legacy_sql: SELECT * FROM samples WHERE active = 1
    key_columns: [id]
"#;

    #[test]
    fn test_from_yaml_minimal() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.legacy.r#type, StoreKind::Memory);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.history.backend, HistoryBackendKind::File);
        assert_eq!(config.queries.len(), 1);
        assert!(config.migration.is_none());
        assert_eq!(config.default_options().max_concurrent_operations, 4);
    }

    #[test]
    fn test_migration_section_camel_case() {
        let yaml = format!(
            "{}migration:\n  removeAuthentication: true\n  seeding:\n    batchSize: 250\n",
            MINIMAL
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let options = config.default_options();
        assert!(options.remove_authentication);
        assert_eq!(options.seeding.batch_size, 250);
    }

    #[test]
    fn test_invalid_migration_section_is_config_error() {
        let yaml = format!("{}migration:\n  maxConcurrentOperations: 0\n", MINIMAL);
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Config::from_yaml(MINIMAL).unwrap();
        let b = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn test_options_file_accepts_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"validateAgainstLegacy": false, "seeding": {"batchSize": 50}}"#,
        )
        .unwrap();
        let options = MigrationOptions::load(file.path()).unwrap();
        assert!(!options.validate_against_legacy);
        assert_eq!(options.seeding.batch_size, 50);
        assert_eq!(options.max_concurrent_operations, 4);
    }

    #[test]
    fn test_auto_tuning_keeps_explicit_options() {
        let yaml = format!("{}migration:\n  maxConcurrentOperations: 3\n", MINIMAL);
        let config = Config::from_yaml(&yaml).unwrap().with_auto_tuning();
        assert_eq!(config.default_options().max_concurrent_operations, 3);
    }
}
