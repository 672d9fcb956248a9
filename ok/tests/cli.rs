//! CLI tests for the `ok` binary.
//!
//! Spawns the binary and checks exit codes and `--show-config` output. No
//! test here reaches a model.

use std::fs;
use std::process::Command;

use ok::exit_codes;

fn ok_cmd(dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_ok"));
    cmd.current_dir(dir).env("HOME", dir).env_remove("RUST_LOG");
    cmd
}

#[test]
fn show_config_prints_effective_toml() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join(".ok.toml"),
        "[implement]\nmax-implementation-attempts = 7\n",
    )
    .expect("write config");

    let out = ok_cmd(temp.path())
        .args(["--show-config", "--claude", "--max-consecutive-failures", "2"])
        .output()
        .expect("run ok");

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("engine = \"claude\""));
    assert!(stdout.contains("max-implementation-attempts = 7"));
    assert!(stdout.contains("max-consecutive-failures = 2"));
}

#[test]
fn no_tasks_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = ok_cmd(temp.path()).status().expect("run ok");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn zero_limit_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = ok_cmd(temp.path())
        .args(["--max-implementation-attempts", "0", "task"])
        .output()
        .expect("run ok");
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("max-implementation-attempts"));
}

#[test]
fn prompts_conflict_with_config_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join(".ok.toml"),
        "[[tasks]]\nprompt = \"from file\"\n",
    )
    .expect("write config");
    let out = ok_cmd(temp.path())
        .args(["--show-config", "from the command line"])
        .output()
        .expect("run ok");
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("[[tasks]]"));
}

#[test]
fn conflicting_engines_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = ok_cmd(temp.path())
        .args(["--gemini", "--codex", "task"])
        .status()
        .expect("run ok");
    assert_eq!(status.code(), Some(2));
}
