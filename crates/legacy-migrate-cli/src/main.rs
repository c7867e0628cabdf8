//! legacy-migrate CLI - serve the migration control API or drive a run.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use legacy_migrate::api::{create_router, AppState};
use legacy_migrate::auth_removal::AuthRemovalPlanner;
use legacy_migrate::report::ReportFormat;
use legacy_migrate::{
    Config, LogBuffer, MigrateError, MigrationOptions, MigrationRun, Orchestrator, RunLogLayer,
    RunStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "legacy-migrate")]
#[command(about = "Legacy-to-modern data migration orchestrator")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control API
    Serve {
        /// Override the listen address (host:port)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one migration to completion
    Run {
        /// Run options file (YAML or JSON); defaults to the config's migration section
        #[arg(long)]
        options: Option<PathBuf>,

        /// Override number of concurrent operations
        #[arg(long)]
        workers: Option<usize>,

        /// Skip the validation phase
        #[arg(long)]
        skip_validation: bool,

        /// Run the authentication removal phase
        #[arg(long)]
        remove_auth: bool,
    },

    /// List recent runs, newest first
    History {
        /// Maximum number of runs to list
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show aggregate statistics over recent runs
    Stats {
        /// Window size in days
        #[arg(long, default_value = "30")]
        days: u32,
    },

    /// Write the report of a run
    Report {
        /// Migration ID
        migration_id: String,

        /// Report format: json or csv
        #[arg(long, default_value = "json")]
        format: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Restore files from an authentication removal backup
    Rollback {
        /// Backup ID (auth_backup_YYYYMMDD_HHMMSS)
        backup_id: String,

        /// Backup directory; defaults to the configured one
        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },

    /// Validate the configuration and test store connections
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // Setup logging
    let log_buffer = LogBuffer::new();
    setup_logging(&cli.verbosity, &cli.log_format, log_buffer.clone())
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::CheckConfig => {
            let options = config.default_options();
            let warnings = legacy_migrate::config::validate_options(&options, None)?;
            let orchestrator = Orchestrator::from_config(&config, None).await?;
            let (legacy_ok, target_ok) = orchestrator.ping_stores().await;

            if cli.output_json {
                let summary = serde_json::json!({
                    "valid": true,
                    "warnings": warnings,
                    "legacyConnected": legacy_ok,
                    "targetConnected": target_ok,
                    "historyBackend": orchestrator.history_backend(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Configuration OK: {:?}", cli.config);
                for warning in &warnings {
                    println!("  Warning: {}", warning);
                }
                println!("  Legacy: {}", if legacy_ok { "OK" } else { "FAILED" });
                println!("  Target: {}", if target_ok { "OK" } else { "FAILED" });
                println!("  History backend: {}", orchestrator.history_backend());
            }

            if !(legacy_ok && target_ok) {
                return Err(MigrateError::Connection("store health check failed".to_string()));
            }
        }

        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let orchestrator = Orchestrator::from_config(&config, Some(log_buffer)).await?;
            let recovered = orchestrator.recover().await?;
            if recovered > 0 {
                warn!("Recovered {} interrupted runs", recovered);
            }

            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Control API listening on {}", bind);

            let app = create_router(AppState::new(orchestrator.clone()));
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel_token.cancelled_owned())
                .await?;

            if let Some(active) = orchestrator.current() {
                info!("Cancelling active run {} before exit", active.migration_id);
                if let Err(e) = orchestrator.cancel(&active.migration_id).await {
                    warn!("Could not cancel {}: {}", active.migration_id, e);
                }
                wait_bounded(&orchestrator, &active.migration_id, cli.shutdown_timeout).await?;
            }
        }

        Commands::Run {
            options,
            workers,
            skip_validation,
            remove_auth,
        } => {
            let mut options = match options {
                Some(path) => MigrationOptions::load(path)?,
                None => config.default_options(),
            };
            if let Some(w) = workers {
                options.max_concurrent_operations = w;
            }
            if skip_validation {
                options.validate_against_legacy = false;
            }
            if remove_auth {
                options.remove_authentication = true;
            }

            let orchestrator = Orchestrator::from_config(&config, Some(log_buffer)).await?;
            orchestrator.recover().await?;
            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;

            let id = orchestrator.start(options).await?;
            let run = drive_to_end(&orchestrator, &id, &cancel_token, cli.progress, cli.shutdown_timeout).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_summary(&run);
            }

            match run.status {
                RunStatus::Completed => {}
                RunStatus::Cancelled => return Err(MigrateError::Cancelled),
                _ => {
                    let reason = run
                        .errors
                        .iter()
                        .rev()
                        .find(|e| e.level == legacy_migrate::history::ErrorLevel::Fatal)
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| format!("{:?}", run.status));
                    return Err(MigrateError::Fatal(format!("migration {} failed: {}", id, reason)));
                }
            }
        }

        Commands::History { limit } => {
            let orchestrator = Orchestrator::from_config(&config, None).await?;
            let runs = orchestrator.history(limit).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No migration runs recorded");
            } else {
                for run in &runs {
                    println!(
                        "{}  {:<10}  {}  {:>8.1}s  {} rows  {} errors",
                        run.migration_id,
                        format!("{:?}", run.status),
                        run.start_time.format("%Y-%m-%d %H:%M:%S"),
                        run.duration().num_milliseconds() as f64 / 1000.0,
                        run.statistics.processed_rows,
                        run.errors.len()
                    );
                }
            }
        }

        Commands::Stats { days } => {
            let orchestrator = Orchestrator::from_config(&config, None).await?;
            let stats = orchestrator.statistics(days).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Migration statistics (last {} days):", stats.window_days);
                println!("  Total runs: {}", stats.total_runs);
                println!("  Successful: {}", stats.successful_runs);
                println!("  Failed: {}", stats.failed_runs);
                println!("  Cancelled: {}", stats.cancelled_runs);
                println!("  Average duration: {:.1}s", stats.average_duration_secs);
                println!("  Rows processed: {}", stats.total_rows_processed);
                println!("  Tables processed: {}", stats.total_tables_processed);
            }
        }

        Commands::Report {
            migration_id,
            format,
            output,
        } => {
            let format: ReportFormat = format.parse()?;
            let orchestrator = Orchestrator::from_config(&config, None).await?;
            let report = orchestrator.report(&migration_id, format).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, report.body)?;
                    println!("Report written to {:?}", path);
                }
                None => println!("{}", report.body),
            }
        }

        Commands::Rollback {
            backup_id,
            backup_dir,
        } => {
            let result = match backup_dir {
                Some(dir) => AuthRemovalPlanner::rollback(&dir, &backup_id)?,
                None => {
                    let orchestrator = Orchestrator::from_config(&config, None).await?;
                    orchestrator.rollback(&backup_id).await?
                }
            };

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.success {
                println!("Rollback of {} completed", result.backup_id);
                println!("  Files restored: {}", result.restored.len());
            } else {
                println!("Rollback of {} refused, no file was changed", result.backup_id);
                for failure in &result.failed {
                    println!("  {:?}: {}", failure.path, failure.reason);
                }
            }

            if !result.success {
                return Err(MigrateError::Fatal(format!(
                    "backup {} failed verification",
                    result.backup_id
                )));
            }
        }
    }

    Ok(())
}

/// Wait for a run, cancelling it on shutdown and printing progress lines.
async fn drive_to_end(
    orchestrator: &Orchestrator,
    id: &str,
    cancel_token: &CancellationToken,
    progress: bool,
    shutdown_timeout: u64,
) -> Result<MigrationRun, MigrateError> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let wait = orchestrator.wait(id);
    tokio::pin!(wait);

    loop {
        tokio::select! {
            run = &mut wait => return run,
            _ = cancel_token.cancelled() => {
                if let Err(e) = orchestrator.cancel(id).await {
                    warn!("Could not cancel {}: {}", id, e);
                }
                return wait_bounded(orchestrator, id, shutdown_timeout).await;
            }
            _ = ticker.tick(), if progress => {
                if let Some(view) = orchestrator.progress() {
                    eprintln!("{}", serde_json::to_string(&view)?);
                }
            }
        }
    }
}

/// Wait for a cancelled run to drain, up to the shutdown timeout.
async fn wait_bounded(
    orchestrator: &Orchestrator,
    id: &str,
    shutdown_timeout: u64,
) -> Result<MigrationRun, MigrateError> {
    match tokio::time::timeout(Duration::from_secs(shutdown_timeout), orchestrator.wait(id)).await {
        Ok(run) => run,
        Err(_) => Err(MigrateError::timeout("graceful shutdown", shutdown_timeout)),
    }
}

fn print_summary(run: &MigrationRun) {
    println!("\nMigration {:?}", run.status);
    println!("  Run ID: {}", run.migration_id);
    println!(
        "  Duration: {:.2}s",
        run.duration().num_milliseconds() as f64 / 1000.0
    );
    if let Some(seeding) = &run.seeding_result {
        println!(
            "  Tables: {} completed, {} failed",
            seeding.tables_completed, seeding.tables_failed
        );
        println!(
            "  Rows: {} inserted, {} skipped",
            seeding.total_rows_inserted, seeding.total_rows_skipped
        );
    }
    if let Some(validation) = &run.validation_result {
        println!(
            "  Validation: {}/{} queries matched ({:.1}%), {} discrepancies",
            validation.summary.queries_matched,
            validation.summary.queries_attempted,
            validation.summary.match_percentage,
            validation.summary.total_discrepancies
        );
    }
    if let Some(auth) = &run.auth_removal_result {
        println!(
            "  Auth removal: {} files modified, {} components removed",
            auth.modified_files.len(),
            auth.removed_components.len()
        );
        if let Some(id) = &auth.backup_id {
            println!("  Backup: {}", id);
        }
    }
    if !run.errors.is_empty() {
        println!("  Errors: {}", run.errors.len());
    }
}

fn setup_logging(verbosity: &str, format: &str, buffer: LogBuffer) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let fmt_layer = if format == "json" {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(LevelFilter::from_level(level)))
        .with(RunLogLayer::new(buffer).with_filter(LevelFilter::INFO))
        .try_init()
        .map_err(|e| e.to_string())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let mut stream = signal(kind)?;
        let token = cancel_token.clone();
        tokio::spawn(async move {
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                name, shutdown_timeout
            );
            token.cancel();
        });
    }

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(_shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
