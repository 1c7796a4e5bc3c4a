//! Integration tests for the agent-sandbox CLI.
//!
//! These run the real binary in a temporary directory and check output,
//! exit codes and files written.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

#[allow(deprecated)]
fn agent_sandbox() -> Command {
    Command::cargo_bin("agent-sandbox").expect("failed to find agent-sandbox binary")
}

fn agent_sandbox_in(dir: &TempDir) -> Command {
    let mut cmd = agent_sandbox();
    cmd.current_dir(dir.path());
    cmd
}

fn initialized() -> TempDir {
    let dir = TempDir::new().unwrap();
    agent_sandbox_in(&dir).arg("init").assert().success();
    dir
}

// -----------------------------------------------------------------------------
// Help and version
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    agent_sandbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("clean"));
}

#[test]
fn test_version() {
    agent_sandbox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("agent-sandbox"));
}

#[test]
fn test_run_help_lists_options() {
    agent_sandbox()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--runtime"))
        .stdout(predicate::str::contains("--watch"))
        .stdout(predicate::str::contains("--duration-secs"));
}

// -----------------------------------------------------------------------------
// init
// -----------------------------------------------------------------------------

#[test]
fn test_init_writes_samples() {
    let dir = initialized();
    assert!(dir.path().join("agent-sandbox.toml").exists());
    assert!(dir.path().join("manifest.toml").exists());
}

#[test]
fn test_init_skips_existing_without_force() {
    let dir = initialized();
    fs::write(dir.path().join("manifest.toml"), "# mine\n").unwrap();

    agent_sandbox_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
    assert_eq!(
        fs::read_to_string(dir.path().join("manifest.toml")).unwrap(),
        "# mine\n"
    );

    agent_sandbox_in(&dir)
        .args(["init", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("overwritten"));
    assert!(fs::read_to_string(dir.path().join("manifest.toml"))
        .unwrap()
        .contains("python-pool"));
}

// -----------------------------------------------------------------------------
// validate
// -----------------------------------------------------------------------------

#[test]
fn test_validate_sample_manifest() {
    let dir = initialized();
    agent_sandbox_in(&dir)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("python"));
}

#[test]
fn test_validate_rejects_dangling_reference() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("manifest.toml"),
        "[[pools]]\nname = \"p\"\ntemplateRef = \"missing\"\ndesiredReady = 1\n",
    )
    .unwrap();

    agent_sandbox_in(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stdout(predicate::str::contains("template 'missing' is not declared"));
}

#[test]
fn test_validate_missing_manifest_fails() {
    let dir = TempDir::new().unwrap();
    agent_sandbox_in(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read manifest"));
}

// -----------------------------------------------------------------------------
// status and clean
// -----------------------------------------------------------------------------

#[test]
fn test_status_without_snapshot() {
    let dir = TempDir::new().unwrap();
    agent_sandbox_in(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No snapshot found"));
}

#[test]
fn test_clean_with_nothing_to_clean() {
    let dir = TempDir::new().unwrap();
    agent_sandbox_in(&dir)
        .arg("clean")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to clean"));
}

#[test]
fn test_clean_all_removes_samples() {
    let dir = initialized();
    agent_sandbox_in(&dir)
        .args(["clean", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed"));
    assert!(!dir.path().join("agent-sandbox.toml").exists());
    assert!(!dir.path().join("manifest.toml").exists());
}

// -----------------------------------------------------------------------------
// run
// -----------------------------------------------------------------------------

#[test]
fn test_run_simulated_binds_claim_and_writes_snapshot() {
    let dir = initialized();

    agent_sandbox_in(&dir)
        .args(["run", "--runtime", "simulated", "--duration-secs", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Controller stopped"));

    let snapshot = fs::read_to_string(dir.path().join(".agent-sandbox/state.toml")).unwrap();
    assert!(snapshot.contains("python-pool"));
    assert!(snapshot.contains("phase = \"Bound\""));

    agent_sandbox_in(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("python-pool"))
        .stdout(predicate::str::contains("agent-1"))
        .stdout(predicate::str::contains("Bound"));

    agent_sandbox_in(&dir).arg("clean").assert().success();
    assert!(!dir.path().join(".agent-sandbox/state.toml").exists());
}

#[test]
fn test_run_rejects_unknown_runtime() {
    let dir = initialized();
    agent_sandbox_in(&dir)
        .args(["run", "--runtime", "podman", "--duration-secs", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown runtime"));
}

#[test]
fn test_run_writes_json_log_file() {
    let dir = initialized();
    agent_sandbox_in(&dir)
        .args([
            "run",
            "--runtime",
            "simulated",
            "--duration-secs",
            "1",
            "--log-format",
            "json",
            "--log-file",
            "logs/agent-sandbox.log",
        ])
        .assert()
        .success();

    let log = fs::read_to_string(dir.path().join("logs/agent-sandbox.log")).unwrap();
    assert!(log.lines().any(|line| line.contains("\"controller started\"")));
}
