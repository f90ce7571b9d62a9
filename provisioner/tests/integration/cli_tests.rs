//! CLI structure, argument parsing and failures that happen before any
//! network I/O.

#![allow(clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;

fn vdi() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("vdi-provisioner"));
    cmd.env("NO_COLOR", "1");
    cmd.env_remove("VDI_CONFIG");
    cmd
}

/// Path to a config file that does not exist, so defaults apply.
fn no_config(dir: &tempfile::TempDir) -> String {
    dir.path().join("absent.yaml").display().to_string()
}

// --- Help and version ---

#[test]
fn test_cli_no_args_shows_help() {
    vdi().assert().code(2).stderr(predicate::str::contains(
        "Provision and configure Windows virtual desktops",
    ));
}

#[test]
fn test_cli_help_lists_commands() {
    vdi()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("provision"))
        .stdout(predicate::str::contains("delete-desktop"))
        .stdout(predicate::str::contains("destroy-project"))
        .stdout(predicate::str::contains("install"));
}

#[test]
fn test_version_command_shows_version() {
    vdi()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vdi-provisioner 0.1.0"));
}

#[test]
fn test_no_color_accepts_any_non_empty_value() {
    for value in ["1", "yes", "true", "0"] {
        vdi()
            .env("NO_COLOR", value)
            .arg("version")
            .assert()
            .success()
            .stdout(predicate::str::contains("vdi-provisioner 0.1.0"));
    }
}

#[test]
fn test_version_command_json_outputs_valid_json() {
    let output = vdi()
        .args(["version", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value =
        serde_json::from_slice(&output).expect("version --json should print JSON");
    assert_eq!(value["version"], "0.1.0");
}

// --- Argument validation ---

#[test]
fn test_provision_requires_mode_and_request() {
    vdi()
        .arg("provision")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--mode"));
}

#[test]
fn test_provision_rejects_unknown_mode() {
    vdi()
        .args(["provision", "--mode", "shared", "--request", "r.json"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_install_requires_target_and_role() {
    vdi()
        .args(["install", "--password", "pw"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--target"));
}

#[test]
fn test_install_rejects_malformed_var() {
    vdi()
        .args([
            "install", "--target", "10.0.0.5", "--role", "chrome", "--password", "pw", "--var",
            "novalue",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

// --- Failures before any connection ---

#[test]
fn test_provision_missing_request_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    vdi()
        .args(["--config", &no_config(&dir)])
        .args(["provision", "--mode", "personal", "--request"])
        .arg(dir.path().join("missing.json"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn test_malformed_config_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "infra: [not, a, map]\n").expect("write config");
    vdi()
        .arg("--config")
        .arg(&path)
        .args(["status", "job-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot parse"));
}

#[test]
fn test_logs_without_path_or_job_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    vdi()
        .args(["--config", &no_config(&dir), "logs"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("give a log path or --job"));
}

#[test]
fn test_json_errors_are_printed_as_objects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = vdi()
        .args(["--json", "--config", &no_config(&dir), "logs"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value =
        serde_json::from_slice(&output).expect("error should be JSON");
    assert_eq!(value["error"], true);
    assert_eq!(value["code"], "ERROR");
    assert!(
        value["message"]
            .as_str()
            .is_some_and(|m| m.contains("give a log path"))
    );
}
