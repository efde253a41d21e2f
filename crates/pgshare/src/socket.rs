//! Resolution of the server's Unix socket directory and TCP port.
//!
//! PostgreSQL names its socket `.s.PGSQL.<port>` inside the directory given
//! by `-k`. Unix socket addresses are limited to roughly a hundred bytes, so
//! a deeply nested data directory cannot host its own socket. In that case
//! the socket moves to a short hashed directory under the coordination
//! namespace.

use std::fs::{self, DirBuilder};
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, info};

const SOCKET_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::socket");

/// Port PostgreSQL listens on when none is configured.
pub const DEFAULT_PORT: u16 = 5432;

const HASH_LENGTH: usize = 10;

/// Errors raised while resolving a socket directory.
#[derive(Debug, Error)]
pub enum SocketPathError {
    /// A candidate directory could not be created.
    #[error("failed to create socket directory '{path}': {source}")]
    CreateDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Inspecting a candidate path failed.
    #[error("failed to inspect socket path '{path}': {source}")]
    Inspect {
        /// Path that could not be inspected.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Binding the trial socket failed for a reason other than path length.
    #[error("failed to bind trial socket '{path}': {source}")]
    Bind {
        /// Socket path that failed to bind.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// No candidate directory could host the socket.
    #[error("no usable socket directory for '{preferred}'; tried {tried:?}")]
    Exhausted {
        /// Directory the socket would normally live in.
        preferred: PathBuf,
        /// Every candidate directory tried.
        tried: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Usable,
    TooLong,
    Occupied,
}

/// Returns the socket filename PostgreSQL creates for `port`.
#[must_use]
pub fn socket_file_name(port: u16) -> String {
    format!(".s.PGSQL.{port}")
}

/// Picks the directory the server should create its socket in.
///
/// `preferred_dir` is tried first, then `fallback_base_dir/<hash>`. Both are
/// created with their parents before probing.
///
/// # Errors
///
/// Returns [`SocketPathError::Exhausted`] when every candidate is too long or
/// occupied by a non-socket file, and other variants for hard IO failures.
pub fn resolve_socket_dir(
    preferred_dir: &Path,
    fallback_base_dir: &Path,
    port: u16,
) -> Result<PathBuf, SocketPathError> {
    let file_name = socket_file_name(port);
    create_dir(preferred_dir)?;
    let mut tried = Vec::with_capacity(2);

    match check_candidate(&preferred_dir.join(&file_name))? {
        Candidate::Usable => {
            info!(
                target: SOCKET_TARGET,
                dir = %preferred_dir.display(),
                "using data directory for socket"
            );
            return Ok(preferred_dir.to_path_buf());
        }
        outcome => log_rejection(preferred_dir, outcome),
    }
    tried.push(preferred_dir.to_path_buf());

    let fallback = fallback_base_dir.join(directory_hash(preferred_dir)?);
    create_dir(&fallback)?;
    match check_candidate(&fallback.join(&file_name))? {
        Candidate::Usable => {
            info!(
                target: SOCKET_TARGET,
                dir = %fallback.display(),
                preferred = %preferred_dir.display(),
                "using fallback socket directory"
            );
            Ok(fallback)
        }
        outcome => {
            log_rejection(&fallback, outcome);
            tried.push(fallback);
            Err(SocketPathError::Exhausted {
                preferred: preferred_dir.to_path_buf(),
                tried,
            })
        }
    }
}

/// Returns a free TCP port on `address`, as assigned by the kernel.
///
/// The port is released before returning, so another process may claim it
/// first; the server start then fails and reports the conflict.
///
/// # Errors
///
/// Propagates bind failures.
pub fn find_free_port(address: &str) -> io::Result<u16> {
    let listener = TcpListener::bind((address, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Stable short hash over the canonical path and inode of `dir`.
///
/// The inode keeps a recreated directory at the same path from inheriting a
/// socket directory that belonged to the storage it replaced.
///
/// # Errors
///
/// Returns [`SocketPathError::Inspect`] when `dir` cannot be resolved.
pub fn directory_hash(dir: &Path) -> Result<String, SocketPathError> {
    let inspect = |source: io::Error| SocketPathError::Inspect {
        path: dir.to_path_buf(),
        source,
    };
    let canonical = fs::canonicalize(dir).map_err(inspect)?;
    let inode = inode_of(&canonical).map_err(inspect)?;
    let digest = Sha256::digest(format!("{}-{inode}", canonical.display()).as_bytes());
    let mut hash: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hash.truncate(HASH_LENGTH);
    Ok(hash)
}

#[cfg(unix)]
fn inode_of(path: &Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(path)?.ino())
}

#[cfg(not(unix))]
fn inode_of(path: &Path) -> io::Result<u64> {
    fs::metadata(path).map(|_| 0)
}

fn create_dir(path: &Path) -> Result<(), SocketPathError> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    match builder.create(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(SocketPathError::CreateDirectory {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn check_candidate(socket_path: &Path) -> Result<Candidate, SocketPathError> {
    match fs::symlink_metadata(socket_path) {
        Ok(metadata) => return Ok(classify_existing(&metadata)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            // The kernel may refuse even to stat a path whose name is too long.
            if is_too_long(&source) {
                return Ok(Candidate::TooLong);
            }
            return Err(SocketPathError::Inspect {
                path: socket_path.to_path_buf(),
                source,
            });
        }
    }
    trial_bind(socket_path)
}

#[cfg(unix)]
fn classify_existing(metadata: &fs::Metadata) -> Candidate {
    use std::os::unix::fs::FileTypeExt;
    if metadata.file_type().is_socket() {
        Candidate::Usable
    } else {
        Candidate::Occupied
    }
}

#[cfg(not(unix))]
fn classify_existing(_metadata: &fs::Metadata) -> Candidate {
    Candidate::Occupied
}

fn trial_bind(socket_path: &Path) -> Result<Candidate, SocketPathError> {
    let bind_error = |source: io::Error| SocketPathError::Bind {
        path: socket_path.to_path_buf(),
        source,
    };
    let address = match SockAddr::unix(socket_path) {
        Ok(address) => address,
        Err(error) if is_too_long(&error) => return Ok(Candidate::TooLong),
        Err(source) => return Err(bind_error(source)),
    };
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(bind_error)?;
    let outcome = match socket.bind(&address) {
        Ok(()) => Candidate::Usable,
        Err(error) if is_too_long(&error) => Candidate::TooLong,
        Err(source) => return Err(bind_error(source)),
    };
    drop(socket);
    if outcome == Candidate::Usable {
        match fs::remove_file(socket_path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(bind_error(source)),
        }
    }
    Ok(outcome)
}

fn is_too_long(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::InvalidInput
        || error.raw_os_error() == Some(libc::ENAMETOOLONG)
}

fn log_rejection(dir: &Path, outcome: Candidate) {
    let reason = match outcome {
        Candidate::TooLong => "socket path too long",
        Candidate::Occupied => "socket path occupied by a non-socket file",
        Candidate::Usable => return,
    };
    debug!(
        target: SOCKET_TARGET,
        dir = %dir.display(),
        reason,
        "socket directory rejected"
    );
}
