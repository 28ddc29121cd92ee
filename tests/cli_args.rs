//! Binary-level checks: argument handling, checkpoint commands and exit codes.
//! None of these reach an external tool.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn tilepipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tilepipe"))
        .args(args)
        .env_clear()
        .output()
        .expect("Failed to run tilepipe")
}

fn state_arg(dir: &TempDir) -> String {
    dir.path().join("state").display().to_string()
}

fn write_token(dir: &Path, stage: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("{}.token", stage)), format!("{}\n", "a".repeat(64))).unwrap();
}

#[test]
fn test_cli_help() {
    let output = tilepipe(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("status"));
    assert!(stdout.contains("reset-checkpoints"));
}

#[test]
fn test_cli_version() {
    let output = tilepipe(&["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_stage_rejected() {
    let output = tilepipe(&["run", "tiles"]);
    assert!(!output.status.success());
}

#[test]
fn test_invalid_zoom_range_exits_2() {
    let dir = TempDir::new().unwrap();
    let state = state_arg(&dir);
    let output = tilepipe(&[
        "-q",
        "run",
        "--state-dir",
        &state,
        "--min-zoom",
        "8",
        "--max-zoom",
        "3",
    ]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_source_exits_2() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("absent.osm.pbf").display().to_string();
    let output_root = dir.path().join("out").display().to_string();
    let output = tilepipe(&[
        "run",
        "import",
        "--external-engine",
        "--output-root",
        &output_root,
        "--source",
        &source,
    ]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("absent.osm.pbf"), "stderr: {}", stderr);
    assert!(!dir.path().join("out").exists());
}

#[test]
fn test_status_json_lists_all_stages() {
    let dir = TempDir::new().unwrap();
    write_token(&dir.path().join("state"), "import");

    let state = state_arg(&dir);
    let output = tilepipe(&["status", "--state-dir", &state, "--format", "json"]);
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let stages = value["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 3);
    assert_eq!(stages[0]["stage"], "import");
    assert_eq!(stages[0]["token"], "a".repeat(64));
    assert!(stages[2]["token"].is_null());
}

#[test]
fn test_status_human() {
    let dir = TempDir::new().unwrap();
    let state = state_arg(&dir);
    let output = tilepipe(&["status", "--state-dir", &state]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.matches("absent").count(), 3);
}

#[test]
fn test_reset_stage_clears_downstream_only() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("state");
    for stage in ["import", "statistics-refresh", "render"] {
        write_token(&state_dir, stage);
    }

    let state = state_arg(&dir);
    let output = tilepipe(&["reset-checkpoints", "statistics-refresh", "--state-dir", &state]);
    assert!(output.status.success());

    assert!(state_dir.join("import.token").exists());
    assert!(!state_dir.join("statistics-refresh.token").exists());
    assert!(!state_dir.join("render.token").exists());
}

#[test]
fn test_reset_all() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("state");
    write_token(&state_dir, "import");
    write_token(&state_dir, "render");

    let state = state_arg(&dir);
    let output = tilepipe(&["reset-checkpoints", "--state-dir", &state]);
    assert!(output.status.success());
    assert!(!state_dir.join("import.token").exists());
    assert!(!state_dir.join("render.token").exists());
}

#[test]
fn test_config_file_is_applied() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("tilepipe.toml");
    fs::write(&config, "min_zoom = 9\nmax_zoom = 2\n").unwrap();

    let config_arg = config.display().to_string();
    let state = state_arg(&dir);
    let output = tilepipe(&["--config", &config_arg, "run", "--state-dir", &state]);
    assert_eq!(output.status.code(), Some(2));
}
