//! CLI subprocess integration tests.
//!
//! These tests invoke the `stagehand` binary against a temporary site that
//! uses the mock package manager and check exit codes and JSON output.

use stagehand_toolkit::{InstalledPackages, MockStager, Stager, LOCK_FILE};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Site {
    _dir: tempfile::TempDir,
    active: PathBuf,
    config: PathBuf,
}

fn site() -> Site {
    let dir = tempfile::tempdir().unwrap();
    let active = dir.path().join("site");
    fs::create_dir_all(&active).unwrap();
    MockStager::new("vendor")
        .stage(&["require".to_owned(), "a:1.0".to_owned()], &active, None)
        .unwrap();
    let config = dir.path().join("stagehand.toml");
    fs::write(
        &config,
        format!(
            r#"active_dir = "{}"
min_free_space_mb = 0

[package_manager]
kind = "mock"
"#,
            active.display()
        ),
    )
    .unwrap();
    Site {
        _dir: dir,
        active,
        config,
    }
}

fn stagehand(site: &Site, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .arg("--config")
        .arg(&site.config)
        .args(["--actor", "alice", "--json"])
        .args(args)
        .output()
        .unwrap()
}

fn json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn installed_version(active: &Path) -> String {
    InstalledPackages::read(&active.join("vendor"))
        .unwrap()
        .get("a")
        .unwrap()
        .version
        .clone()
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["create", "require", "apply", "post-apply", "destroy", "cron"] {
        assert!(stdout.contains(command), "help must list '{command}'");
    }
}

#[test]
fn cli_full_lifecycle() {
    let site = site();
    let created = json(&stagehand(&site, &["create"]));
    let stage_id = created["stage_id"].as_str().unwrap().to_owned();
    assert_eq!(created["owner"], "alice");

    json(&stagehand(&site, &["require", "--stage-id", &stage_id, "a:2.0"]));
    json(&stagehand(&site, &["apply", "--stage-id", &stage_id]));
    assert_eq!(installed_version(&site.active), "2.0");
    json(&stagehand(&site, &["post-apply", "--stage-id", &stage_id]));

    let status = json(&stagehand(&site, &["status"]));
    assert_eq!(status["claim"]["phase"], "Applied");

    let destroyed = json(&stagehand(&site, &["destroy", "--stage-id", &stage_id]));
    assert_eq!(destroyed["destroyed"], stage_id.as_str());
    let status = json(&stagehand(&site, &["status"]));
    assert!(status["claim"].is_null());
}

#[test]
fn cli_validation_failure_exits_2() {
    let site = site();
    fs::remove_file(site.active.join(LOCK_FILE)).unwrap();
    let output = stagehand(&site, &["create"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("validation refused"), "{stderr}");
}

#[test]
fn cli_failure_marker_exits_3_until_cleared() {
    let site = site();
    fs::write(
        site.active.join("STAGEHAND_APPLY_FAILURE.json"),
        r#"{"message": "apply crashed"}"#,
    )
    .unwrap();
    let output = stagehand(&site, &["create"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("apply crashed"));

    let cleared = json(&stagehand(&site, &["clear-failure", "--yes"]));
    assert_eq!(cleared["cleared"], true);
    json(&stagehand(&site, &["create"]));
}

#[test]
fn cli_logs_stay_off_stdout_in_json_mode() {
    let site = site();
    fs::write(
        site.active.join("STAGEHAND_APPLY_FAILURE.json"),
        r#"{"message": "apply crashed"}"#,
    )
    .unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .env("STAGEHAND_LOG", "debug")
        .arg("--config")
        .arg(&site.config)
        .args(["--json", "clear-failure", "--yes"])
        .output()
        .unwrap();
    let cleared = json(&output);
    assert_eq!(cleared["cleared"], true);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failure marker cleared"), "{stderr}");
}

#[test]
fn cli_other_actor_cannot_claim() {
    let site = site();
    let created = json(&stagehand(&site, &["create"]));
    let stage_id = created["stage_id"].as_str().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .arg("--config")
        .arg(&site.config)
        .args(["--actor", "bob", "apply", "--stage-id", stage_id])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_destroy_without_stage_succeeds() {
    let site = site();
    let destroyed = json(&stagehand(&site, &["destroy"]));
    assert!(destroyed["destroyed"].is_null());
}

#[test]
fn cli_cron_disabled_by_default() {
    let site = site();
    let outcome = json(&stagehand(&site, &["cron"]));
    assert_eq!(outcome["outcome"], "disabled");
}

#[test]
fn cli_missing_config_fails() {
    let output = Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .args(["--config", "/nonexistent/stagehand.toml", "status"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}
