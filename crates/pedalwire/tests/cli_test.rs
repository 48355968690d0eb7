//! Integration tests for the `pedalwire` CLI binary.
//!
//! These tests validate argument parsing, help output, shell completions,
//! config file handling, and a simulated scan, all without radio hardware.
#![allow(clippy::unwrap_used)]

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `pedalwire` binary with env isolation.
///
/// Clears the `PEDALWIRE_*` variables the CLI reads and points config
/// directories at a nonexistent path so tests never touch the user's real
/// configuration.
fn pedalwire_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("pedalwire");
    cmd.env("HOME", "/tmp/pedalwire-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/pedalwire-cli-test-nonexistent")
        .env_remove("PEDALWIRE_CONFIG")
        .env_remove("PEDALWIRE_OUTPUT")
        .env_remove("PEDALWIRE_SCAN__WINDOW_SECS")
        .env_remove("PEDALWIRE_SERVER__BIND")
        .env_remove("PEDALWIRE_RADIO__BLE_ENABLED")
        .env_remove("PEDALWIRE_RADIO__ANT_ENABLED")
        .env_remove("RUST_LOG");
    cmd
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = pedalwire_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_flag() {
    pedalwire_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("cycling sensors")
            .and(predicate::str::contains("serve"))
            .and(predicate::str::contains("scan"))
            .and(predicate::str::contains("config")),
    );
}

#[test]
fn test_version_flag() {
    pedalwire_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pedalwire"));
}

#[test]
fn test_serve_help_lists_flags() {
    pedalwire_cmd()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--bind").and(predicate::str::contains("--simulate")));
}

#[test]
fn test_invalid_subcommand() {
    let output = pedalwire_cmd().arg("pedal-harder").output().unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(2));
}

// ── Completions ─────────────────────────────────────────────────────

#[test]
fn test_completions_bash() {
    pedalwire_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pedalwire"));
}

#[test]
fn test_completions_zsh() {
    pedalwire_cmd()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef pedalwire"));
}

#[test]
fn test_completions_fish() {
    pedalwire_cmd()
        .args(["completions", "fish"])
        .assert()
        .success()
        .stdout(predicate::str::contains("complete -c pedalwire"));
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_path_uses_platform_dir() {
    pedalwire_cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_path_honors_flag() {
    pedalwire_cmd()
        .args(["config", "path", "--config", "/tmp/elsewhere/pw.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/tmp/elsewhere/pw.toml"));
}

#[test]
fn test_config_init_then_show() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let path_arg = path.to_str().unwrap();

    pedalwire_cmd()
        .args(["config", "init", "--config", path_arg])
        .assert()
        .success();
    assert!(path.exists());

    let output = pedalwire_cmd()
        .args(["config", "show", "-o", "json", "--config", path_arg])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    let cfg: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(cfg["server"]["bind"], "127.0.0.1:8787");
    assert_eq!(cfg["scan"]["window_secs"], 60);
    assert_eq!(cfg["session"]["auto_start"], true);
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[scan]\nwindow_secs = 30\n").unwrap();
    let path_arg = path.to_str().unwrap();

    let output = pedalwire_cmd()
        .args(["config", "init", "--config", path_arg])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(6));
    assert!(combined_output(&output).contains("--force"));
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "[scan]\nwindow_secs = 30\n"
    );

    pedalwire_cmd()
        .args(["config", "init", "--force", "--config", path_arg])
        .assert()
        .success();
    assert!(std::fs::read_to_string(&path).unwrap().contains("window_secs = 60"));
}

#[test]
fn test_env_override_is_validated() {
    let output = pedalwire_cmd()
        .env("PEDALWIRE_SCAN__WINDOW_SECS", "0")
        .args(["config", "show"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("window_secs"));
}

// ── Scan ────────────────────────────────────────────────────────────

#[test]
fn test_simulated_scan_lists_sensors() {
    let output = pedalwire_cmd()
        .args(["scan", "--simulate", "--seconds", "1", "-o", "json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));

    let devices: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = devices
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["name"].as_str())
        .collect();
    assert!(names.contains(&"Polar H10 5A1B2C"), "{names:?}");
    assert!(names.contains(&"ASSIOMA 31337"), "{names:?}");
}

#[test]
fn test_scan_without_radios_fails_with_hint() {
    let output = pedalwire_cmd()
        .args(["scan", "--seconds", "1"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(7));
    assert!(combined_output(&output).contains("--simulate"));
}
