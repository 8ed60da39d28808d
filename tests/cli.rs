use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

// sha256("hello")
const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn sprintbench() -> Command {
    let mut cmd = Command::cargo_bin("sprintbench").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("SPRINTBENCH_CONFIG")
        .env_remove("SPRINTBENCH_RUNS_DIR");
    cmd
}

fn write_config(dir: &Path, with_hitl: bool) {
    fs::create_dir_all(dir.join("prompts")).unwrap();
    fs::write(dir.join("prompts/01.txt"), "Build the CRUD API").unwrap();
    if with_hitl {
        fs::write(dir.join("hitl.txt"), "Use SQLite.").unwrap();
    }
    fs::write(
        dir.join("sprintbench.yaml"),
        r#"
runs_dir: runs
hitl_file: hitl.txt
steps:
  - id: crud
    prompt_file: prompts/01.txt
frameworks:
  toolkit:
    kind: cli
    commit: abc123
    binary: tool
"#,
    )
    .unwrap();
}

fn write_run(dir: &Path, archive_bytes: &[u8]) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("run.tar.gz"), archive_bytes).unwrap();
    fs::write(
        dir.join("metadata.json"),
        format!(
            r#"{{
  "run_id": "run-1",
  "framework": "toolkit",
  "commit": "abc123",
  "archive_file": "run.tar.gz",
  "sha256": "{}",
  "size_bytes": 5,
  "created_at": "2026-01-01T00:00:00Z",
  "status": "completed",
  "start_time": "2026-01-01T00:00:00Z",
  "end_time": "2026-01-01T00:10:00Z"
}}"#,
            HELLO_SHA256
        ),
    )
    .unwrap();
}

#[test]
fn schema_prints_config_schema() {
    sprintbench()
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("frameworks"))
        .stdout(predicate::str::contains("stopping_rule"));
}

#[test]
fn missing_config_fails() {
    let dir = TempDir::new().unwrap();
    sprintbench()
        .args(["run", "toolkit", "--config"])
        .arg(dir.path().join("nope.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config"));
}

#[test]
fn unknown_framework_fails_before_any_run_dir() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), true);
    sprintbench()
        .args(["run", "nonexistent", "--config"])
        .arg(dir.path().join("sprintbench.yaml"))
        .assert()
        .failure();
    assert!(!dir.path().join("runs").exists());
}

#[test]
fn missing_hitl_file_fails_before_any_run_dir() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), false);
    sprintbench()
        .args(["run", "toolkit", "--config"])
        .arg(dir.path().join("sprintbench.yaml"))
        .assert()
        .failure();
    assert!(!dir.path().join("runs").exists());
}

#[test]
fn verify_accepts_matching_archive() {
    let dir = TempDir::new().unwrap();
    write_run(dir.path(), b"hello");
    sprintbench()
        .arg("verify")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("OK toolkit run-1"));
}

#[test]
fn verify_rejects_tampered_archive() {
    let dir = TempDir::new().unwrap();
    write_run(dir.path(), b"jello");
    sprintbench()
        .arg("verify")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Integrity"));
}

#[test]
fn converge_with_no_runs_continues() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), true);
    sprintbench()
        .args(["converge", "--config"])
        .arg(dir.path().join("sprintbench.yaml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("toolkit: continue (0 run(s))"));
}

#[test]
fn manifest_rebuild_on_empty_runs_dir() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), true);
    sprintbench()
        .args(["manifest", "rebuild", "--config"])
        .arg(dir.path().join("sprintbench.yaml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("with 0 run(s)"));
    assert!(dir.path().join("runs/manifest.json").is_file());
}
