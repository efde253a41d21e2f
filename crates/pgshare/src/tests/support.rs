//! Test doubles and fixtures shared by the lifecycle suites.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use tempfile::TempDir;

use pgshare_config::Config;

use crate::commands::{
    CommandFailure, CommandOutput, ServerCommands, ServerStatus, StartRequest, StopMode,
};
use crate::coordinator::Coordinator;
use crate::refcount::OwnerId;
use crate::status::{self, ServerState, marker_path, render_marker};

/// Owner id used for a simulated second process. Outside the pid range, so
/// it is reported as dead but never collides with a real holder.
pub const PEER_OWNER: OwnerId = u32::MAX - 7;

/// Configuration file the fake server refuses to start without.
pub const CONFIG_FILE_NAME: &str = "postgresql.conf";

/// Invocation counts recorded by [`FakeServer`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub init: usize,
    pub start: usize,
    pub stop: usize,
}

/// Stand-in for the PostgreSQL binaries.
///
/// `start` spawns a real long-lived child and records its pid in a
/// `postmaster.pid` marker, so liveness checks see a genuine process.
/// `stop` kills and reaps the child and removes the marker.
#[derive(Debug, Default)]
pub struct FakeServer {
    children: Mutex<HashMap<u32, Child>>,
    calls: Mutex<Calls>,
}

impl FakeServer {
    pub fn calls(&self) -> Calls {
        *lock(&self.calls)
    }

    fn record(&self, update: impl FnOnce(&mut Calls)) {
        update(&mut lock(&self.calls));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn output(program: &str, args: &[&str], code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        program: program.to_owned(),
        args: args.iter().map(|arg| (*arg).to_owned()).collect(),
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

fn capture(program: &'static str) -> impl FnOnce(io::Error) -> CommandFailure {
    move |source| CommandFailure::Capture {
        program: program.to_owned(),
        source,
    }
}

fn append_log(path: &Path, line: &str) -> io::Result<()> {
    let mut log = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(log, "{line}")
}

impl ServerCommands for FakeServer {
    fn init(&self, data_dir: &Path, _superuser: &str) -> Result<CommandOutput, CommandFailure> {
        self.record(|calls| calls.init += 1);
        fs::write(data_dir.join("PG_VERSION"), "16\n").map_err(capture("initdb"))?;
        fs::write(data_dir.join(CONFIG_FILE_NAME), "# fake\n").map_err(capture("initdb"))?;
        Ok(output("initdb", &["-D"], 0, ""))
    }

    fn start(&self, request: &StartRequest) -> Result<CommandOutput, CommandFailure> {
        self.record(|calls| calls.start += 1);
        let data_dir = &request.data_dir;
        let config = data_dir.join(CONFIG_FILE_NAME);
        if !config.is_file() {
            let cause = format!(
                "FATAL:  could not open configuration file \"{}\": No such file or directory",
                config.display()
            );
            append_log(&request.log_file, &cause).map_err(capture("pg_ctl"))?;
            return Err(CommandFailure::Exited(output(
                "pg_ctl",
                &["start"],
                1,
                "pg_ctl: could not start server\nExamine the log output.\n",
            )));
        }
        if let Ok(ServerState::Running(marker)) = status::server_state(data_dir) {
            return Err(CommandFailure::Exited(output(
                "pg_ctl",
                &["start"],
                1,
                &format!("FATAL:  lock file \"postmaster.pid\" already exists (PID {})", marker.pid),
            )));
        }
        let child = Command::new("sleep")
            .arg("600")
            .spawn()
            .map_err(|source| CommandFailure::Spawn {
                program: "sleep".to_owned(),
                source,
            })?;
        let pid = child.id();
        lock(&self.children).insert(pid, child);
        fs::write(
            marker_path(data_dir),
            render_marker(pid, data_dir, request.port, &request.socket_dir, "ready"),
        )
        .map_err(capture("pg_ctl"))?;
        append_log(
            &request.log_file,
            "LOG:  database system is ready to accept connections",
        )
        .map_err(capture("pg_ctl"))?;
        Ok(output("pg_ctl", &["start"], 0, ""))
    }

    fn stop(&self, data_dir: &Path, _mode: StopMode) -> Result<CommandOutput, CommandFailure> {
        self.record(|calls| calls.stop += 1);
        let Ok(Some(marker)) = status::read(data_dir) else {
            return Err(CommandFailure::Exited(output(
                "pg_ctl",
                &["stop"],
                1,
                &format!(
                    "pg_ctl: PID file \"{}\" does not exist\nIs server running?\n",
                    marker_path(data_dir).display()
                ),
            )));
        };
        if let Some(mut child) = lock(&self.children).remove(&marker.pid) {
            child.kill().map_err(capture("pg_ctl"))?;
            child.wait().map_err(capture("pg_ctl"))?;
        }
        fs::remove_file(marker_path(data_dir)).map_err(capture("pg_ctl"))?;
        Ok(output("pg_ctl", &["stop"], 0, ""))
    }

    fn status(&self, data_dir: &Path) -> Result<ServerStatus, CommandFailure> {
        Ok(match status::server_state(data_dir) {
            Ok(ServerState::Running(marker)) => ServerStatus::Running {
                pid: Some(marker.pid),
            },
            _ => ServerStatus::Stopped,
        })
    }

    fn query(&self, uri: &str, sql: &str) -> Result<String, CommandFailure> {
        Ok(format!("{uri}\n{sql}"))
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        for (_, mut child) in lock(&self.children).drain() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Isolated runtime namespace and data directories for one test.
pub struct TestEnv {
    root: TempDir,
    pub fake: Arc<FakeServer>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("test root"),
            fake: Arc::new(FakeServer::default()),
        }
    }

    pub fn config(&self) -> Config {
        let runtime =
            Utf8PathBuf::from_path_buf(self.root.path().join("ns")).expect("utf8 temp path");
        Config {
            runtime_dir: Some(runtime),
            lock_timeout_ms: 5_000,
            ..Config::default()
        }
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        let commands: Arc<dyn ServerCommands> = self.fake.clone();
        Coordinator::with_commands(self.config(), commands).expect("coordinator")
    }

    /// Coordinator standing in for another process sharing the namespace.
    pub fn peer(&self) -> Arc<Coordinator> {
        let commands: Arc<dyn ServerCommands> = self.fake.clone();
        Coordinator::with_owner(self.config(), commands, PEER_OWNER).expect("peer coordinator")
    }

    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Path nested deeply enough that its socket address would not fit.
    pub fn long_data_dir(&self) -> PathBuf {
        let mut dir = self.data_dir("long");
        for _ in 0..5 {
            dir.push("a_rather_long_directory_segment_for_sockets");
        }
        dir
    }
}

/// Pid of a process that has already exited and been reaped.
pub fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("reap true");
    pid
}
