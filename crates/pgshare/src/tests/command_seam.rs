//! Call-count and failure-path checks on the external program seam.

use std::fs;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use tempfile::TempDir;

use pgshare_config::Config;

use crate::commands::{
    CommandFailure, CommandOutput, MockServerCommands, ServerCommands, StopMode,
};
use crate::coordinator::{CleanupPolicy, Coordinator};
use crate::errors::LifecycleError;
use crate::liveness::is_running;
use crate::status::{marker_path, render_marker};

fn success(program: &str) -> CommandOutput {
    CommandOutput {
        program: program.to_owned(),
        args: Vec::new(),
        code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn coordinator(root: &TempDir, mock: MockServerCommands) -> Arc<Coordinator> {
    let config = Config {
        runtime_dir: Some(
            Utf8PathBuf::from_path_buf(root.path().join("ns")).expect("utf8 temp path"),
        ),
        ..Config::default()
    };
    let commands: Arc<dyn ServerCommands> = Arc::new(mock);
    Coordinator::with_commands(config, commands).expect("coordinator")
}

/// Expects one `initdb` that writes `PG_VERSION`.
fn expect_init(mock: &mut MockServerCommands) {
    mock.expect_init()
        .withf(|_, superuser| superuser == "postgres")
        .times(1)
        .returning(|data_dir, _| {
            fs::write(data_dir.join("PG_VERSION"), "16\n").expect("version file");
            Ok(success("initdb"))
        });
}

/// Expects one start that records this test process as the server.
fn expect_start_as_self(mock: &mut MockServerCommands) {
    mock.expect_start().times(1).returning(|request| {
        let marker = render_marker(
            std::process::id(),
            &request.data_dir,
            request.port,
            &request.socket_dir,
            "ready",
        );
        fs::write(marker_path(&request.data_dir), marker).expect("marker");
        Ok(success("pg_ctl"))
    });
}

#[test]
fn initialisation_failure_never_starts() {
    let root = TempDir::new().expect("root");
    let mut mock = MockServerCommands::new();
    mock.expect_init().times(1).returning(|_, _| {
        Err(CommandFailure::Exited(CommandOutput {
            program: "initdb".to_owned(),
            args: vec!["-D".to_owned()],
            code: Some(1),
            stdout: String::new(),
            stderr: "initdb: error: cannot be run as root".to_owned(),
        }))
    });
    mock.expect_start().times(0);

    let error = coordinator(&root, mock)
        .acquire(root.path().join("data"), CleanupPolicy::Stop)
        .expect_err("init fails");
    assert!(matches!(error, LifecycleError::InitializationFailed { .. }));
    assert!(error.to_string().contains("cannot be run as root"));
}

#[test]
fn start_without_live_pid_is_a_startup_failure() {
    let root = TempDir::new().expect("root");
    let mut mock = MockServerCommands::new();
    expect_init(&mut mock);
    mock.expect_start()
        .times(1)
        .returning(|_| Ok(success("pg_ctl")));

    let error = coordinator(&root, mock)
        .acquire(root.path().join("data"), CleanupPolicy::Stop)
        .expect_err("no marker appears");
    let text = error.to_string();
    assert!(text.contains("no live server process"), "{text}");
    assert!(text.contains("server log"), "{text}");
}

#[test]
fn policy_none_never_stops() {
    let root = TempDir::new().expect("root");
    let mut mock = MockServerCommands::new();
    expect_init(&mut mock);
    expect_start_as_self(&mut mock);
    mock.expect_stop().times(0);

    let coordinator = coordinator(&root, mock);
    let data_dir = root.path().join("data");
    let first = coordinator
        .acquire(&data_dir, CleanupPolicy::None)
        .expect("first");
    let second = coordinator
        .acquire(&data_dir, CleanupPolicy::None)
        .expect("second");
    second.release().expect("second release");
    first.release().expect("first release");
}

#[test]
fn stop_policy_issues_one_fast_stop() {
    let root = TempDir::new().expect("root");
    let mut mock = MockServerCommands::new();
    expect_init(&mut mock);
    expect_start_as_self(&mut mock);

    let data_dir = root.path().join("data");
    fs::create_dir(&data_dir).expect("data dir");
    let canonical = fs::canonicalize(&data_dir).expect("canonical");
    mock.expect_stop()
        .withf(move |dir, mode| dir == canonical.as_path() && *mode == StopMode::Fast)
        .times(1)
        .returning(|_, _| Ok(success("pg_ctl")));

    coordinator(&root, mock)
        .acquire(&data_dir, CleanupPolicy::Stop)
        .expect("acquire")
        .release()
        .expect("release");
}

#[test]
fn failed_stop_keeps_directory_under_delete_policy() {
    let root = TempDir::new().expect("root");
    let mut mock = MockServerCommands::new();
    expect_init(&mut mock);
    expect_start_as_self(&mut mock);
    mock.expect_stop().times(1).returning(|_, _| {
        Err(CommandFailure::Exited(CommandOutput {
            program: "pg_ctl".to_owned(),
            args: vec!["stop".to_owned()],
            code: Some(1),
            stdout: String::new(),
            stderr: "pg_ctl: could not send stop signal (PID: 1): Operation not permitted"
                .to_owned(),
        }))
    });

    let data_dir = root.path().join("data");
    coordinator(&root, mock)
        .acquire(&data_dir, CleanupPolicy::Delete)
        .expect("acquire")
        .release()
        .expect("release logs the stop failure");
    assert!(data_dir.is_dir());
}

#[test]
fn running_server_is_reused_without_commands() {
    let root = TempDir::new().expect("root");
    let data_dir = root.path().join("data");
    fs::create_dir(&data_dir).expect("data dir");
    fs::write(data_dir.join("PG_VERSION"), "16\n").expect("version");
    fs::write(
        marker_path(&data_dir),
        render_marker(std::process::id(), &data_dir, 5432, &data_dir, "ready"),
    )
    .expect("marker");
    let mut mock = MockServerCommands::new();
    mock.expect_init().times(0);
    mock.expect_start().times(0);

    let handle = coordinator(&root, mock)
        .acquire(&data_dir, CleanupPolicy::None)
        .expect("reuse");
    assert_eq!(handle.pid().expect("pid"), Some(std::process::id()));
}

#[test]
fn crashed_server_is_still_deleted() {
    let root = TempDir::new().expect("root");
    let server: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));
    let mut mock = MockServerCommands::new();
    expect_init(&mut mock);
    let spawned = Arc::clone(&server);
    mock.expect_start().times(1).returning(move |request| {
        let child = Command::new("sleep").arg("600").spawn().expect("spawn sleep");
        let marker = render_marker(
            child.id(),
            &request.data_dir,
            request.port,
            &request.socket_dir,
            "ready",
        );
        fs::write(marker_path(&request.data_dir), marker).expect("marker");
        *spawned.lock().expect("child slot") = Some(child);
        Ok(success("pg_ctl"))
    });
    mock.expect_stop().times(1).returning(|_, _| {
        Err(CommandFailure::Exited(CommandOutput {
            program: "pg_ctl".to_owned(),
            args: vec!["stop".to_owned()],
            code: Some(1),
            stdout: String::new(),
            stderr: "pg_ctl: could not send stop signal (PID: 4242): No such process\n"
                .to_owned(),
        }))
    });

    let data_dir = root.path().join("data");
    let handle = coordinator(&root, mock)
        .acquire(&data_dir, CleanupPolicy::Delete)
        .expect("acquire");
    let mut child = server
        .lock()
        .expect("child slot")
        .take()
        .expect("server spawned");
    let pid = child.id();
    child.kill().expect("kill server");
    child.wait().expect("reap server");
    assert!(!is_running(pid));

    handle.release().expect("release");
    assert!(!data_dir.exists());
}
