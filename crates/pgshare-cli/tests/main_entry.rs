//! Integration tests for the `pgshare` binary entry point.
//!
//! Covers read-only subcommands, which never spawn PostgreSQL, and
//! user-facing error reporting.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn help_lists_subcommands() {
    let mut command = cargo_bin_cmd!("pgshare");
    command.arg("--help");
    command
        .assert()
        .success()
        .stdout(contains("status"))
        .stdout(contains("query"));
}

#[test]
fn status_of_empty_directory_is_absent() {
    let root = TempDir::new().expect("temp dir");
    let mut command = cargo_bin_cmd!("pgshare");
    command
        .env("PGSHARE_RUNTIME_DIR", root.path().join("ns"))
        .arg("status")
        .arg(root.path());
    command
        .assert()
        .success()
        .stdout(contains("initialised: no"))
        .stdout(contains("state: absent"))
        .stdout(contains("owners: none"));
}

#[test]
fn uri_without_running_server_fails() {
    let root = TempDir::new().expect("temp dir");
    let mut command = cargo_bin_cmd!("pgshare");
    command
        .env("PGSHARE_RUNTIME_DIR", root.path().join("ns"))
        .arg("uri")
        .arg(root.path());
    command
        .assert()
        .failure()
        .stderr(contains("no server is running"));
}

#[test]
fn missing_data_directory_is_reported() {
    let root = TempDir::new().expect("temp dir");
    let mut command = cargo_bin_cmd!("pgshare");
    command.arg("status").arg(root.path().join("missing"));
    command.assert().failure().stderr(contains("missing"));
}

#[test]
fn unknown_subcommand_fails() {
    let mut command = cargo_bin_cmd!("pgshare");
    command.arg("restart");
    command
        .assert()
        .failure()
        .stderr(contains("unrecognized subcommand"));
}
