//! Invocation of the external PostgreSQL programs.
//!
//! `initdb`, `pg_ctl`, and `psql` are opaque collaborators judged by exit
//! status and captured output. Output is captured into anonymous temporary
//! files rather than pipes: `pg_ctl start` leaves the server holding the
//! inherited descriptors, so a pipe would not reach end-of-file until the
//! server exited.

use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use strum::{Display, EnumString};
use thiserror::Error;
use tracing::{error, info};

const COMMANDS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::commands");

/// Exit status `pg_ctl status` uses for "no server running".
const STATUS_NOT_RUNNING: i32 = 3;
/// Exit status `pg_ctl status` uses for "no accessible data directory".
const STATUS_NO_DATA_DIR: i32 = 4;

/// Captured result of one program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Program that ran.
    pub program: String,
    /// Arguments passed, rendered lossily.
    pub args: Vec<String>,
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the program exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "`{}", self.program)?;
        for arg in &self.args {
            write!(formatter, " {arg}")?;
        }
        match self.code {
            Some(code) => write!(formatter, "` exited with status {code}")?,
            None => write!(formatter, "` was terminated by a signal")?,
        }
        write!(
            formatter,
            "\n--- stdout ---\n{}\n--- stderr ---\n{}",
            self.stdout.trim_end(),
            self.stderr.trim_end()
        )
    }
}

/// Failure to run a program to a successful exit.
#[derive(Debug, Error)]
pub enum CommandFailure {
    /// The program could not be launched.
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        /// Program path.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Capturing or feeding program IO failed.
    #[error("failed to capture output of '{program}': {source}")]
    Capture {
        /// Program path.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The program exited unsuccessfully.
    #[error("{0}")]
    Exited(CommandOutput),
}

impl CommandFailure {
    /// Captured output when the program ran to completion.
    #[must_use]
    pub const fn output(&self) -> Option<&CommandOutput> {
        match self {
            Self::Exited(output) => Some(output),
            Self::Spawn { .. } | Self::Capture { .. } => None,
        }
    }
}

/// Shutdown mode passed to `pg_ctl stop -m`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StopMode {
    /// Wait for clients to disconnect.
    Smart,
    /// Roll back open transactions and disconnect clients.
    #[default]
    Fast,
    /// Abort without a clean shutdown; recovery runs on next start.
    Immediate,
}

impl StopMode {
    /// Name understood by `pg_ctl`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Fast => "fast",
            Self::Immediate => "immediate",
        }
    }
}

/// Result of a stop request, with "not running" tolerated.
#[derive(Debug)]
pub enum StopOutcome {
    /// The server was running and has stopped.
    Stopped,
    /// No server was running.
    NotRunning,
    /// Stopping failed for another reason.
    Failed(CommandFailure),
}

impl StopOutcome {
    /// Classifies a `pg_ctl stop` result.
    #[must_use]
    pub fn classify(result: Result<CommandOutput, CommandFailure>) -> Self {
        match result {
            Ok(_) => Self::Stopped,
            Err(CommandFailure::Exited(output)) if reports_not_running(&output) => {
                Self::NotRunning
            }
            Err(failure) => Self::Failed(failure),
        }
    }

    /// Whether the data directory may be removed afterwards.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped | Self::NotRunning)
    }
}

fn reports_not_running(output: &CommandOutput) -> bool {
    output.stderr.contains("Is server running?") || output.stderr.contains("no server running")
}

/// Answer of `pg_ctl status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    /// A server is running, with its pid when reported.
    Running {
        /// Reported server pid.
        pid: Option<u32>,
    },
    /// No server is running for the data directory.
    Stopped,
}

/// Arguments for starting a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Data directory.
    pub data_dir: PathBuf,
    /// Directory the server creates its socket in.
    pub socket_dir: PathBuf,
    /// Server log file.
    pub log_file: PathBuf,
    /// TCP listen address; `None` disables TCP.
    pub listen_address: Option<String>,
    /// Port, which also names the socket file.
    pub port: u16,
}

impl StartRequest {
    /// Options forwarded to the server through `pg_ctl -o`. `pg_ctl` hands
    /// them to a shell, so paths are single-quoted.
    #[must_use]
    pub fn server_options(&self) -> String {
        let listen = self.listen_address.as_deref().unwrap_or("");
        format!(
            "-k {} -h {} -p {}",
            shell_quote(&self.socket_dir.to_string_lossy()),
            shell_quote(listen),
            self.port
        )
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Seam over the external programs so lifecycle logic can run against
/// test doubles.
#[cfg_attr(test, mockall::automock)]
pub trait ServerCommands: Send + Sync {
    /// Initialises an empty data directory with trust authentication.
    fn init(&self, data_dir: &Path, superuser: &str) -> Result<CommandOutput, CommandFailure>;
    /// Starts the server and waits until it accepts connections or fails.
    fn start(&self, request: &StartRequest) -> Result<CommandOutput, CommandFailure>;
    /// Stops the server.
    fn stop(&self, data_dir: &Path, mode: StopMode) -> Result<CommandOutput, CommandFailure>;
    /// Queries whether a server runs for the data directory.
    fn status(&self, data_dir: &Path) -> Result<ServerStatus, CommandFailure>;
    /// Runs SQL through `psql` against `uri`, returning its standard output.
    fn query(&self, uri: &str, sql: &str) -> Result<String, CommandFailure>;
}

/// Production adapter invoking the installed PostgreSQL binaries.
#[derive(Debug, Clone, Default)]
pub struct PgBinaries {
    bin_dir: Option<PathBuf>,
}

impl PgBinaries {
    /// Uses binaries from `bin_dir`, or from `PATH` when `None`.
    #[must_use]
    pub const fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn run(
        &self,
        name: &str,
        args: Vec<OsString>,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, CommandFailure> {
        let program = self.program(name);
        let program_name = program.to_string_lossy().into_owned();
        let capture = |source: io::Error| CommandFailure::Capture {
            program: program_name.clone(),
            source,
        };
        let mut stdout = tempfile::tempfile().map_err(capture)?;
        let mut stderr = tempfile::tempfile().map_err(capture)?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdout(Stdio::from(stdout.try_clone().map_err(capture)?))
            .stderr(Stdio::from(stderr.try_clone().map_err(capture)?))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = command.spawn().map_err(|source| CommandFailure::Spawn {
            program: program_name.clone(),
            source,
        })?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes()).map_err(capture)?;
        }
        let status = child.wait().map_err(capture)?;

        let output = CommandOutput {
            program: program_name.clone(),
            args: args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
            code: status.code(),
            stdout: read_back(&mut stdout).map_err(capture)?,
            stderr: read_back(&mut stderr).map_err(capture)?,
        };
        if output.success() {
            info!(
                target: COMMANDS_TARGET,
                program = %output.program,
                args = ?output.args,
                stdout = %output.stdout.trim_end(),
                stderr = %output.stderr.trim_end(),
                "command succeeded"
            );
            Ok(output)
        } else {
            error!(
                target: COMMANDS_TARGET,
                program = %output.program,
                args = ?output.args,
                code = ?output.code,
                stdout = %output.stdout.trim_end(),
                stderr = %output.stderr.trim_end(),
                "command failed"
            );
            Err(CommandFailure::Exited(output))
        }
    }
}

fn read_back(file: &mut File) -> io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn data_dir_args(data_dir: &Path) -> Vec<OsString> {
    vec![OsString::from("-D"), data_dir.as_os_str().to_owned()]
}

impl ServerCommands for PgBinaries {
    fn init(&self, data_dir: &Path, superuser: &str) -> Result<CommandOutput, CommandFailure> {
        let mut args = data_dir_args(data_dir);
        args.extend(
            ["--auth=trust", "--auth-local=trust", "-U", superuser]
                .into_iter()
                .map(OsString::from),
        );
        self.run("initdb", args, None)
    }

    fn start(&self, request: &StartRequest) -> Result<CommandOutput, CommandFailure> {
        let mut args = data_dir_args(&request.data_dir);
        args.push(OsString::from("-w"));
        args.push(OsString::from("-l"));
        args.push(request.log_file.as_os_str().to_owned());
        args.push(OsString::from("-o"));
        args.push(OsString::from(request.server_options()));
        args.push(OsString::from("start"));
        self.run("pg_ctl", args, None)
    }

    fn stop(&self, data_dir: &Path, mode: StopMode) -> Result<CommandOutput, CommandFailure> {
        let mut args = data_dir_args(data_dir);
        args.extend(
            ["-w", "-m", mode.as_str(), "stop"]
                .into_iter()
                .map(OsString::from),
        );
        self.run("pg_ctl", args, None)
    }

    fn status(&self, data_dir: &Path) -> Result<ServerStatus, CommandFailure> {
        let mut args = data_dir_args(data_dir);
        args.push(OsString::from("status"));
        match self.run("pg_ctl", args, None) {
            Ok(output) => Ok(ServerStatus::Running {
                pid: parse_status_pid(&output.stdout),
            }),
            Err(CommandFailure::Exited(output))
                if matches!(output.code, Some(STATUS_NOT_RUNNING | STATUS_NO_DATA_DIR)) =>
            {
                Ok(ServerStatus::Stopped)
            }
            Err(failure) => Err(failure),
        }
    }

    fn query(&self, uri: &str, sql: &str) -> Result<String, CommandFailure> {
        let args = ["-X", "-v", "ON_ERROR_STOP=1", uri]
            .into_iter()
            .map(OsString::from)
            .collect();
        self.run("psql", args, Some(sql)).map(|output| output.stdout)
    }
}

/// Extracts the pid from `pg_ctl status` output such as
/// `pg_ctl: server is running (PID: 4242)`.
fn parse_status_pid(stdout: &str) -> Option<u32> {
    let (_, rest) = stdout.split_once("(PID: ")?;
    let (pid, _) = rest.split_once(')')?;
    pid.trim().parse().ok()
}
