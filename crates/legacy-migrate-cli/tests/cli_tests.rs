//! CLI integration tests for legacy-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes for configuration errors, and full runs against
//! memory stores loaded from fixture files.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::Path;

/// Get a command for the legacy-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("legacy-migrate").unwrap()
}

const FIXTURE: &str = r#"{
    "tables": [
        {
            "name": "Samples",
            "columns": [
                {"name": "id", "type": "int", "nullable": false},
                {"name": "label", "type": "text"}
            ],
            "primaryKey": ["id"],
            "rows": [[1, "alpha"], [2, "beta"], [3, "gamma"]]
        },
        {
            "name": "Sites",
            "columns": [
                {"name": "id", "type": "int", "nullable": false},
                {"name": "name", "type": "text"}
            ],
            "primaryKey": ["id"],
            "rows": [[10, "north"], [20, "south"]]
        }
    ]
}"#;

/// Write a fixture and a memory-store config into `dir`, returning the config path.
fn write_memory_config(dir: &Path, history: &str) -> std::path::PathBuf {
    let fixture = dir.join("legacy.json");
    std::fs::write(&fixture, FIXTURE).unwrap();

    let config = dir.join("config.yaml");
    let yaml = format!(
        "legacy:\n  type: memory\n  fixture: {}\ntarget:\n  type: memory\nhistory:\n  {}\nmigration:\n  maxConcurrentOperations: 2\n",
        fixture.display(),
        history
    );
    std::fs::write(&config, yaml).unwrap();
    config
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("history"))
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("report"))
        .stdout(predicate::str::contains("rollback"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--options"))
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--skip-validation"))
        .stdout(predicate::str::contains("--remove-auth"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("legacy-migrate"));
}

#[test]
fn test_shutdown_timeout_default() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"));
}

#[test]
fn test_no_subcommand_shows_usage() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_missing_config_file() {
    // Io error exit code
    cmd()
        .args(["-c", "/nonexistent/config.yaml", "check-config"])
        .assert()
        .failure()
        .code(7);
}

#[test]
fn test_invalid_yaml_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "legacy: [unclosed").unwrap();

    cmd()
        .args(["-c", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_empty_config() {
    let file = tempfile::NamedTempFile::new().unwrap();

    cmd()
        .args(["-c", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_postgres_source_requires_host() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "legacy:\n  type: postgres\n  database: lab\n  user: app\ntarget:\n  type: memory").unwrap();

    cmd()
        .args(["-c", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("legacy.host is required"));
}

#[test]
fn test_invalid_report_format() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_memory_config(dir.path(), "backend: memory");

    cmd()
        .args(["-c", config.to_str().unwrap(), "report", "some-id", "--format", "xml"])
        .assert()
        .failure()
        .code(1);
}

// =============================================================================
// Memory Store Runs
// =============================================================================

#[test]
fn test_check_config_memory_stores() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_memory_config(dir.path(), "backend: memory");

    cmd()
        .args(["-c", config.to_str().unwrap(), "check-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("History backend: memory"));
}

#[test]
fn test_run_outputs_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_memory_config(dir.path(), "backend: memory");

    let output = cmd()
        .args(["-c", config.to_str().unwrap(), "--output-json", "run"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let run: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(run["status"], "Completed");
    assert_eq!(run["seedingResult"]["totalRowsInserted"], 5);
    assert_eq!(run["validationResult"]["summary"]["matchPercentage"], 100.0);
}

#[test]
fn test_run_history_persists_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let history_dir = dir.path().join("history");
    let config = write_memory_config(
        dir.path(),
        &format!("backend: file\n  directory: {}", history_dir.display()),
    );
    let config = config.to_str().unwrap();

    cmd()
        .args(["-c", config, "run", "--skip-validation"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Migration Completed"));

    let output = cmd()
        .args(["-c", config, "--output-json", "history"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let runs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0]["validationResult"].is_null());

    let id = runs[0]["migrationId"].as_str().unwrap().to_string();
    let report = dir.path().join("report.csv");
    cmd()
        .args(["-c", config, "report", &id, "--format", "csv", "-o"])
        .arg(&report)
        .assert()
        .success();
    let csv = std::fs::read_to_string(&report).unwrap();
    assert!(csv.starts_with("Migration Report"));

    cmd()
        .args(["-c", config, "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total runs: 1"))
        .stdout(predicate::str::contains("Successful: 1"));
}

#[test]
fn test_report_unknown_run_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_memory_config(dir.path(), "backend: memory");

    cmd()
        .args(["-c", config.to_str().unwrap(), "report", "no-such-run"])
        .assert()
        .failure()
        .code(6);
}

#[test]
fn test_run_rejects_invalid_options_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_memory_config(dir.path(), "backend: memory");
    let options = dir.path().join("options.json");
    std::fs::write(&options, r#"{"maxConcurrentOperations": 0}"#).unwrap();

    cmd()
        .args(["-c", config.to_str().unwrap(), "run", "--options"])
        .arg(&options)
        .assert()
        .failure()
        .code(1);
}
