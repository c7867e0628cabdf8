//! Configuration and run option validation.

use std::net::SocketAddr;

use super::filter::{compile, find_overlap};
use super::options::MigrationOptions;
use super::{Config, DataSourceConfig, HistoryBackendKind, StoreKind};
use crate::error::{MigrateError, Result};

/// Validate the service configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_source("legacy", &config.legacy)?;
    validate_source("target", &config.target)?;

    if config.legacy.r#type == StoreKind::Postgres
        && config.target.r#type == StoreKind::Postgres
        && config.legacy.host == config.target.host
        && config.legacy.port == config.target.port
        && config.legacy.database == config.target.database
        && config.legacy.schema == config.target.schema
    {
        return Err(MigrateError::Config(
            "legacy and target cannot be the same database schema".into(),
        ));
    }

    if config.history.backend == HistoryBackendKind::File
        && config.history.directory.as_os_str().is_empty()
    {
        return Err(MigrateError::Config("history.directory is required".into()));
    }
    if config.history.backend == HistoryBackendKind::Postgres
        && config.target.r#type != StoreKind::Postgres
    {
        return Err(MigrateError::Config(
            "history.backend 'postgres' requires a postgres target".into(),
        ));
    }
    if config.history.lease_ttl_secs == 0 {
        return Err(MigrateError::Config("history.lease_ttl_secs must be at least 1".into()));
    }
    if config.history.integrity_key.is_empty() {
        return Err(MigrateError::Config("history.integrity_key cannot be empty".into()));
    }

    if config.server.bind.parse::<SocketAddr>().is_err() {
        return Err(MigrateError::Config(format!(
            "server.bind must be host:port, got '{}'",
            config.server.bind
        )));
    }

    for (i, query) in config.queries.iter().enumerate() {
        if query.name.trim().is_empty() {
            return Err(MigrateError::Config(format!("queries[{}].name is required", i)));
        }
        if query.legacy_sql.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "queries[{}].legacy_sql is required",
                i
            )));
        }
        if config.queries[..i].iter().any(|q| q.name == query.name) {
            return Err(MigrateError::Config(format!(
                "duplicate query name '{}'",
                query.name
            )));
        }
    }

    if let Some(options) = &config.migration {
        validate_options(options, None).map_err(|e| match e {
            MigrateError::Validation(msg) => MigrateError::Config(format!("migration: {}", msg)),
            other => other,
        })?;
    }

    Ok(())
}

fn validate_source(section: &str, source: &DataSourceConfig) -> Result<()> {
    match source.r#type {
        StoreKind::Postgres => {
            if source.host.is_empty() {
                return Err(MigrateError::Config(format!("{}.host is required", section)));
            }
            if source.database.is_empty() {
                return Err(MigrateError::Config(format!("{}.database is required", section)));
            }
            if source.user.is_empty() {
                return Err(MigrateError::Config(format!("{}.user is required", section)));
            }
        }
        StoreKind::Memory => {}
    }
    if let Some(0) = source.max_connections {
        return Err(MigrateError::Config(format!(
            "{}.max_connections must be at least 1",
            section
        )));
    }
    Ok(())
}

/// Validate run options before a run starts.
///
/// Returns warnings for settings that are legal but likely unintended.
/// `cpu_cores` enables the oversubscription warning when known.
pub fn validate_options(options: &MigrationOptions, cpu_cores: Option<usize>) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    if options.max_concurrent_operations == 0 {
        return Err(MigrateError::Validation(
            "maxConcurrentOperations must be greater than 0".into(),
        ));
    }
    if let Some(cores) = cpu_cores {
        if options.max_concurrent_operations > cores * 2 {
            warnings.push(format!(
                "maxConcurrentOperations ({}) exceeds twice the CPU count ({})",
                options.max_concurrent_operations, cores
            ));
        }
    }
    if options.operation_timeout_secs == 0 {
        return Err(MigrateError::Validation(
            "operationTimeoutSecs must be greater than 0".into(),
        ));
    }

    compile(&options.include_tables)?;
    compile(&options.exclude_tables)?;
    if let Some((inc, exc)) = find_overlap(&options.include_tables, &options.exclude_tables) {
        return Err(MigrateError::Validation(format!(
            "includeTables pattern '{}' overlaps excludeTables pattern '{}'",
            inc, exc
        )));
    }

    let seeding = &options.seeding;
    if seeding.batch_size == 0 {
        return Err(MigrateError::Validation("seeding.batchSize must be greater than 0".into()));
    }
    if seeding.batch_size > 10_000 {
        warnings.push(format!(
            "seeding.batchSize ({}) is large and may hold long transactions",
            seeding.batch_size
        ));
    }
    if seeding.command_timeout_secs == 0 {
        return Err(MigrateError::Validation(
            "seeding.commandTimeoutSecs must be greater than 0".into(),
        ));
    }
    if seeding.retry_delay_ms > seeding.max_retry_delay_ms {
        return Err(MigrateError::Validation(format!(
            "seeding.retryDelayMs ({}) exceeds seeding.maxRetryDelayMs ({})",
            seeding.retry_delay_ms, seeding.max_retry_delay_ms
        )));
    }
    if seeding.max_retries > 10 {
        warnings.push(format!(
            "seeding.maxRetries ({}) is high; a dead store stalls each batch through every retry",
            seeding.max_retries
        ));
    }

    let validation = &options.validation;
    if options.validate_against_legacy {
        if validation.max_discrepancies_to_report == 0 {
            return Err(MigrateError::Validation(
                "validation.maxDiscrepanciesToReport must be greater than 0".into(),
            ));
        }
        if !(0.0..=100.0).contains(&validation.performance_threshold_percent) {
            return Err(MigrateError::Validation(
                "validation.performanceThresholdPercent must be between 0 and 100".into(),
            ));
        }
        if !(0.0..=100.0).contains(&validation.min_match_percentage) {
            return Err(MigrateError::Validation(
                "validation.minMatchPercentage must be between 0 and 100".into(),
            ));
        }
        if validation.query_timeout_secs == 0 {
            return Err(MigrateError::Validation(
                "validation.queryTimeoutSecs must be greater than 0".into(),
            ));
        }
        if let Some(cs) = &validation.legacy_connection_string {
            if cs.trim().is_empty() {
                return Err(MigrateError::Validation(
                    "validation.legacyConnectionString cannot be blank".into(),
                ));
            }
        }
        compile(&validation.include_queries)?;
        compile(&validation.exclude_queries)?;
        if !validation.compare_query_results && !validation.compare_performance {
            warnings.push(
                "validation enabled but neither results nor performance are compared".into(),
            );
        }
    }

    let auth = &options.auth_removal;
    if options.remove_authentication {
        if auth.create_backup && auth.backup_directory.trim().is_empty() {
            return Err(MigrateError::Validation(
                "authRemoval.backupDirectory is required when createBackup is set".into(),
            ));
        }
        compile(&auth.files_to_exclude)?;
        if !auth.create_backup {
            warnings.push("authentication removal will run without backups".into());
        }
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthRemovalConfig, HistoryConfig, ServerConfig};

    fn valid_config() -> Config {
        Config {
            legacy: DataSourceConfig {
                host: "legacy-db".to_string(),
                database: "lab_legacy".to_string(),
                user: "reader".to_string(),
                password: "password".to_string(),
                ..DataSourceConfig::memory(None)
            }
            .with_kind(StoreKind::Postgres),
            target: DataSourceConfig {
                host: "localhost".to_string(),
                database: "lab".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                ..DataSourceConfig::memory(None)
            }
            .with_kind(StoreKind::Postgres),
            history: HistoryConfig::default(),
            server: ServerConfig::default(),
            migration: None,
            queries: Vec::new(),
            auth_removal: AuthRemovalConfig::default(),
        }
    }

    impl DataSourceConfig {
        fn with_kind(mut self, kind: StoreKind) -> Self {
            self.r#type = kind;
            self
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_target_host() {
        let mut config = valid_config();
        config.target.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_memory_source_needs_no_host() {
        let mut config = valid_config();
        config.legacy = DataSourceConfig::memory(None);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.legacy = config.target.clone();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bad_bind_address() {
        let mut config = valid_config();
        config.server.bind = "not-an-address".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_pg_history_requires_pg_target() {
        let mut config = valid_config();
        config.target = DataSourceConfig::memory(None);
        config.history.backend = HistoryBackendKind::Postgres;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_lease_ttl_rejected() {
        let mut config = valid_config();
        config.history.lease_ttl_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_source_config_debug_redacts_password() {
        let mut config = valid_config();
        config.legacy.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.legacy);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }

    #[test]
    fn test_default_options_valid() {
        let warnings = validate_options(&MigrationOptions::default(), Some(8)).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_overlapping_include_exclude_rejected() {
        let mut options = MigrationOptions::default();
        options.include_tables = vec!["Users".into()];
        options.exclude_tables = vec!["Us*".into()];
        let err = validate_options(&options, None).unwrap_err();
        assert!(matches!(err, MigrateError::Validation(_)));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut options = MigrationOptions::default();
        options.max_concurrent_operations = 0;
        assert!(validate_options(&options, None).is_err());

        let mut options = MigrationOptions::default();
        options.seeding.batch_size = 0;
        assert!(validate_options(&options, None).is_err());

        let mut options = MigrationOptions::default();
        options.validation.query_timeout_secs = 0;
        assert!(validate_options(&options, None).is_err());

        let mut options = MigrationOptions::default();
        options.validation.max_discrepancies_to_report = 0;
        assert!(validate_options(&options, None).is_err());
    }

    #[test]
    fn test_retry_delay_above_cap_rejected() {
        let mut options = MigrationOptions::default();
        options.seeding.retry_delay_ms = 5000;
        options.seeding.max_retry_delay_ms = 1000;
        assert!(matches!(
            validate_options(&options, None),
            Err(MigrateError::Validation(ref m)) if m.contains("retryDelayMs")
        ));

        options.seeding.max_retry_delay_ms = 5000;
        options.seeding.max_retries = 20;
        assert_eq!(validate_options(&options, None).unwrap().len(), 1);
    }

    #[test]
    fn test_threshold_range() {
        let mut options = MigrationOptions::default();
        options.validation.performance_threshold_percent = 150.0;
        assert!(validate_options(&options, None).is_err());

        options.validate_against_legacy = false;
        assert!(validate_options(&options, None).is_ok());
    }

    #[test]
    fn test_backup_directory_required() {
        let mut options = MigrationOptions::default();
        options.remove_authentication = true;
        options.auth_removal.backup_directory = " ".into();
        assert!(validate_options(&options, None).is_err());

        options.auth_removal.create_backup = false;
        let warnings = validate_options(&options, None).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_warnings() {
        let mut options = MigrationOptions::default();
        options.max_concurrent_operations = 64;
        options.seeding.batch_size = 50_000;
        let warnings = validate_options(&options, Some(4)).unwrap();
        assert_eq!(warnings.len(), 2);
    }
}
