//! Parsing and validation of the server's status marker.
//!
//! PostgreSQL writes `postmaster.pid` into its data directory while running.
//! The file has eight lines: pid, data directory, start time, port, socket
//! directory, listen address, shared-memory key and id, and status. A marker
//! whose pid is gone, or which cannot be parsed, is stale and must not stop
//! a fresh start.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::liveness;

const STATUS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::status");

/// Filename of the status marker inside a data directory.
pub const MARKER_FILE_NAME: &str = "postmaster.pid";

const MARKER_LINES: usize = 8;

/// Lifecycle phase recorded on the marker's final line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerStatus {
    /// Server is still starting.
    Starting,
    /// Server is shutting down.
    Stopping,
    /// Server accepts connections.
    Ready,
    /// Server runs as a hot standby.
    Standby,
    /// Status string not recognised by this crate.
    Other(String),
}

impl MarkerStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "ready" => Self::Ready,
            "standby" => Self::Standby,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for MarkerStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => formatter.write_str("starting"),
            Self::Stopping => formatter.write_str("stopping"),
            Self::Ready => formatter.write_str("ready"),
            Self::Standby => formatter.write_str("standby"),
            Self::Other(raw) => formatter.write_str(raw),
        }
    }
}

/// Parsed contents of `postmaster.pid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMarker {
    /// Server process id.
    pub pid: u32,
    /// Data directory as recorded by the server.
    pub data_dir: PathBuf,
    /// Start time in seconds since the epoch.
    pub start_time: i64,
    /// Listening port, when recorded.
    pub port: Option<u16>,
    /// Socket directory, blank when the server has no Unix socket.
    pub socket_dir: Option<PathBuf>,
    /// Listen address, blank when TCP is disabled.
    pub listen_address: Option<String>,
    /// Shared-memory key and id, kept verbatim.
    pub shared_memory: Option<String>,
    /// Recorded lifecycle phase.
    pub status: MarkerStatus,
}

/// Reasons a marker fails to parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkerParseError {
    /// The marker did not have exactly eight lines.
    #[error("expected {MARKER_LINES} lines, found {found}")]
    LineCount {
        /// Lines present.
        found: usize,
    },
    /// A numeric field did not parse.
    #[error("field '{field}' is not an integer: '{value}'")]
    NotAnInteger {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: String,
    },
}

impl StatusMarker {
    /// Parses marker text.
    ///
    /// # Errors
    ///
    /// Returns [`MarkerParseError`] when the line count is wrong or a numeric
    /// field is not an integer.
    pub fn parse(content: &str) -> Result<Self, MarkerParseError> {
        let lines: Vec<&str> = content.lines().collect();
        let [pid, data_dir, start_time, port, socket_dir, listen, shmem, status] =
            lines.as_slice()
        else {
            return Err(MarkerParseError::LineCount { found: lines.len() });
        };
        let port = match port.trim() {
            "" => None,
            raw => Some(parse_number::<u16>("port", raw)?),
        };
        Ok(Self {
            pid: parse_number("pid", pid.trim())?,
            data_dir: PathBuf::from(data_dir.trim_end()),
            start_time: parse_number("start_time", start_time.trim())?,
            port,
            socket_dir: non_blank(socket_dir).map(PathBuf::from),
            listen_address: non_blank(listen).map(str::to_owned),
            shared_memory: non_blank(shmem).map(str::to_owned),
            status: MarkerStatus::parse(status.trim()),
        })
    }

    /// Whether the recorded pid is alive.
    #[must_use]
    pub fn is_valid_and_running(&self) -> bool {
        liveness::is_running(self.pid)
    }
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    raw: &str,
) -> Result<T, MarkerParseError> {
    raw.parse().map_err(|_| MarkerParseError::NotAnInteger {
        field,
        value: raw.to_owned(),
    })
}

fn non_blank(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Errors raised while reading a marker from disk.
#[derive(Debug, Error)]
pub enum StatusError {
    /// Reading the marker failed.
    #[error("failed to read status marker '{path}': {source}")]
    Read {
        /// Marker path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The marker is present but malformed.
    #[error("status marker '{path}' is malformed: {source}")]
    Parse {
        /// Marker path.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: MarkerParseError,
    },
}

/// Observed server state for a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// No marker: the server is not running.
    Absent,
    /// Marker present with a live pid.
    Running(StatusMarker),
    /// Marker present but unusable; a fresh start should be attempted.
    Stale {
        /// Why the marker was rejected.
        reason: String,
    },
}

/// Location of the marker inside `data_dir`.
#[must_use]
pub fn marker_path(data_dir: &Path) -> PathBuf {
    data_dir.join(MARKER_FILE_NAME)
}

/// Reads and parses the marker of `data_dir`. `Ok(None)` means absent.
///
/// # Errors
///
/// Returns [`StatusError`] for IO failures other than absence and for
/// malformed markers.
pub fn read(data_dir: &Path) -> Result<Option<StatusMarker>, StatusError> {
    let path = marker_path(data_dir);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StatusError::Read { path, source }),
    };
    StatusMarker::parse(&content)
        .map(Some)
        .map_err(|source| StatusError::Parse { path, source })
}

/// Classifies the state of `data_dir`, folding parse failures and dead pids
/// into [`ServerState::Stale`].
///
/// # Errors
///
/// Returns [`StatusError::Read`] only for unexpected IO failures.
pub fn server_state(data_dir: &Path) -> Result<ServerState, StatusError> {
    let marker = match read(data_dir) {
        Ok(Some(marker)) => marker,
        Ok(None) => return Ok(ServerState::Absent),
        Err(StatusError::Parse { path, source }) => {
            warn!(
                target: STATUS_TARGET,
                file = %path.display(),
                error = %source,
                "status marker is malformed; treating as stale"
            );
            return Ok(ServerState::Stale {
                reason: source.to_string(),
            });
        }
        Err(error) => return Err(error),
    };
    if marker.is_valid_and_running() {
        return Ok(ServerState::Running(marker));
    }
    warn!(
        target: STATUS_TARGET,
        pid = marker.pid,
        data_dir = %data_dir.display(),
        "status marker names a dead process; treating as stale"
    );
    Ok(ServerState::Stale {
        reason: format!("process {} is not running", marker.pid),
    })
}

/// Convenience for callers that only need the live pid.
///
/// # Errors
///
/// Propagates [`server_state`] failures.
pub fn running_pid(data_dir: &Path) -> Result<Option<u32>, StatusError> {
    Ok(match server_state(data_dir)? {
        ServerState::Running(marker) => Some(marker.pid),
        ServerState::Absent | ServerState::Stale { .. } => None,
    })
}

/// Renders marker text in the layout PostgreSQL uses. Test doubles write
/// markers through this so parser and writer cannot drift.
#[cfg(test)]
pub(crate) fn render_marker(
    pid: u32,
    data_dir: &Path,
    port: u16,
    socket_dir: &Path,
    status: &str,
) -> String {
    format!(
        "{pid}\n{}\n1700000000\n{port}\n{}\n\n  5432001    32768\n{status:<8}\n",
        data_dir.display(),
        socket_dir.display()
    )
}
