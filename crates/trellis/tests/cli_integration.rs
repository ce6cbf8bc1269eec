//! CLI integration tests for the trellis binary.
//!
//! Each test points `TRELLIS_CONFIG_DIR` at an empty temp directory so a
//! developer's own config never leaks in.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn trellis(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("trellis").unwrap();
    cmd.env("TRELLIS_CONFIG_DIR", config_dir.path())
        .env_remove("TRELLIS_CONFIG")
        .env_remove("RUST_LOG")
        .current_dir(config_dir.path());
    cmd
}

fn demo_plan() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/pipeline.toml")
}

// ─────────────────────────────────────────────────────────────────────────────
// Help
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    trellis(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("order"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("capabilities"));
}

#[test]
fn test_unknown_subcommand_fails() {
    let dir = TempDir::new().unwrap();
    trellis(&dir).arg("frobnicate").assert().failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_capabilities_lists_demo_set() {
    let dir = TempDir::new().unwrap();
    trellis(&dir)
        .arg("capabilities")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo"))
        .stdout(predicate::str::contains("json_get"))
        .stdout(predicate::str::contains("sleep"));
}

#[test]
fn test_validate_demo_plan() {
    let dir = TempDir::new().unwrap();
    trellis(&dir)
        .arg("validate")
        .arg(demo_plan())
        .assert()
        .success()
        .stdout(predicate::str::contains("valid (0 errors"));
}

#[test]
fn test_validate_rejects_unknown_capability() {
    let dir = TempDir::new().unwrap();
    let plan = dir.path().join("bad.json");
    std::fs::write(
        &plan,
        r#"{"id": "bad", "steps": [{"id": "a", "capability": "teleport"}]}"#,
    )
    .unwrap();

    trellis(&dir)
        .arg("validate")
        .arg(&plan)
        .assert()
        .failure()
        .stdout(predicate::str::contains("unknown capability 'teleport'"));
}

#[test]
fn test_order_prints_levels() {
    let dir = TempDir::new().unwrap();
    trellis(&dir)
        .args(["--json", "order"])
        .arg(demo_plan())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"levels\""))
        .stdout(predicate::str::contains("\"demo-pipeline\""));
}

#[test]
fn test_run_demo_plan() {
    let dir = TempDir::new().unwrap();
    trellis(&dir)
        .arg("run")
        .arg(demo_plan())
        .args(["--input", "title=Trellis", "--session", "cli"])
        .assert()
        .success()
        .stdout(predicate::str::contains("recovered by flaky_backup"))
        .stdout(predicate::str::contains("8 steps"));
}

#[test]
fn test_run_streaming_json() {
    let dir = TempDir::new().unwrap();
    trellis(&dir)
        .args(["--json", "run"])
        .arg(demo_plan())
        .args(["--input", "title=Trellis", "--stream"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"type\":\"step_started\""))
        .stdout(predicate::str::contains("\"type\":\"final\""));
}

#[test]
fn test_run_without_input_reports_failure() {
    let dir = TempDir::new().unwrap();
    trellis(&dir)
        .arg("run")
        .arg(demo_plan())
        .assert()
        .failure()
        .stderr(predicate::str::contains("step(s) failed: fetch"));
}

#[test]
fn test_explicit_config_must_exist() {
    let dir = TempDir::new().unwrap();
    trellis(&dir)
        .args(["--config", "does-not-exist.toml", "capabilities"])
        .assert()
        .failure();
}
