//! Binary smoke tests for the `overlord` CLI.
//!
//! These run the actual compiled binary via `assert_cmd` and check the
//! surfaces that must never regress: help, version, config validation,
//! and the fatal exit on invalid configuration.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn overlord() -> Command {
    let mut cmd = Command::cargo_bin("overlord").unwrap();
    // A hermetic environment: no operator config leaks into the tests.
    cmd.env_remove("OVERLORD_DIR")
        .env_remove("MAX_CONCURRENT")
        .env_remove("CRON_SCHEDULE")
        .env_remove("WATCHED_REPOS")
        .env_remove("GITHUB_TOKEN")
        .env_remove("CHAT_BOT_TOKEN")
        .env_remove("CHAT_CHANNEL")
        .env_remove("LOG_FILE");
    cmd
}

// ── Binary builds and runs ──────────────────────────────────────────────────

#[test]
fn binary_exists() {
    overlord();
}

#[test]
fn help_flag() {
    overlord()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestrator"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn version_flag() {
    overlord()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("overlord "));
}

// ── check-config ────────────────────────────────────────────────────────────

#[test]
fn check_config_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    overlord()
        .arg("--dir")
        .arg(dir.path())
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration OK"));
}

#[test]
fn check_config_reads_config_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config"), "max_concurrent=0\n").unwrap();

    overlord()
        .arg("--dir")
        .arg(dir.path())
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("MAX_CONCURRENT"));
}

#[test]
fn check_config_rejects_bad_cron() {
    let dir = TempDir::new().unwrap();
    overlord()
        .arg("--dir")
        .arg(dir.path())
        .arg("check-config")
        .env("CRON_SCHEDULE", "whenever")
        .assert()
        .failure()
        .stderr(predicate::str::contains("CRON_SCHEDULE"));
}

#[test]
fn check_config_rejects_watched_repos_without_token() {
    let dir = TempDir::new().unwrap();
    overlord()
        .arg("--dir")
        .arg(dir.path())
        .arg("check-config")
        .env("WATCHED_REPOS", "owner/repo")
        .assert()
        .failure()
        .stderr(predicate::str::contains("GITHUB_TOKEN"));
}

// ── run with invalid configuration exits non-zero ───────────────────────────

#[test]
fn run_refuses_invalid_config() {
    let dir = TempDir::new().unwrap();
    overlord()
        .arg("--dir")
        .arg(dir.path())
        .arg("run")
        .env("MAX_CONCURRENT", "0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("MAX_CONCURRENT"));
}

#[test]
fn unknown_subcommand_fails() {
    overlord().arg("frobnicate").assert().failure();
}
