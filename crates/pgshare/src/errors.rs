//! Unified error surface for acquiring, using, and releasing shared servers.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoError;
use thiserror::Error;

use pgshare_config::RuntimePathsError;

use crate::commands::CommandFailure;
use crate::lock::LockError;
use crate::refcount::{OwnerId, RefcountError};
use crate::socket::SocketPathError;
use crate::status::StatusError;

/// Errors surfaced by the lifecycle coordinator.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Config {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// The coordination namespace could not be prepared.
    #[error(transparent)]
    RuntimePaths(#[from] RuntimePathsError),
    /// The data directory could not be created, resolved, or removed.
    #[error("data directory '{path}' is unusable: {source}")]
    DataDirectory {
        /// Data directory path as given.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// `initdb` failed.
    #[error("failed to initialise data directory '{data_dir}': {source}")]
    InitializationFailed {
        /// Data directory being initialised.
        data_dir: PathBuf,
        /// Captured invocation.
        #[source]
        source: CommandFailure,
    },
    /// The server did not come up.
    #[error(
        "server for '{data_dir}' failed to start: {reason}\n--- server log tail ---\n{log_tail}"
    )]
    StartupFailed {
        /// Data directory of the server.
        data_dir: PathBuf,
        /// Command failure or missing pid.
        reason: String,
        /// Last lines of the server's own log.
        log_tail: String,
    },
    /// No directory could host the server socket.
    #[error("no usable socket directory for '{data_dir}': {source}")]
    SocketPathUnavailable {
        /// Data directory of the server.
        data_dir: PathBuf,
        /// Resolution failure.
        #[source]
        source: SocketPathError,
    },
    /// No TCP port could be reserved.
    #[error("failed to reserve a TCP port: {source}")]
    Port {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The cross-process lock stayed contended for the whole wait budget.
    #[error("lock '{path}' unavailable after {timeout:?}")]
    LockUnavailable {
        /// Lock file path.
        path: PathBuf,
        /// Wait budget that elapsed.
        timeout: Duration,
    },
    /// The lock file could not be opened or locked.
    #[error("failed to lock '{path}': {source}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The refcount record could not be read or updated.
    #[error(transparent)]
    Refcount(#[from] RefcountError),
    /// The status marker could not be read.
    #[error(transparent)]
    Status(#[from] StatusError),
    /// A query or status command failed.
    #[error("{program} failed: {source}")]
    Command {
        /// Program that failed.
        program: &'static str,
        /// Captured invocation.
        #[source]
        source: CommandFailure,
    },
    /// An explicit stop failed.
    #[error("failed to stop server for '{data_dir}': {source}")]
    StopFailed {
        /// Data directory of the server.
        data_dir: PathBuf,
        /// Captured invocation.
        #[source]
        source: CommandFailure,
    },
    /// An explicit stop was refused because holders are registered.
    #[error("server for '{data_dir}' is still held by {owners:?}")]
    StillHeld {
        /// Data directory of the server.
        data_dir: PathBuf,
        /// Registered owners.
        owners: Vec<OwnerId>,
    },
}

impl From<Arc<OrthoError>> for LifecycleError {
    fn from(source: Arc<OrthoError>) -> Self {
        Self::Config { source }
    }
}

impl From<LockError> for LifecycleError {
    fn from(source: LockError) -> Self {
        match source {
            LockError::Unavailable { path, timeout } => Self::LockUnavailable { path, timeout },
            LockError::Io { path, source } => Self::Lock { path, source },
        }
    }
}
