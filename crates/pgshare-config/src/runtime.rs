//! Derives coordination namespace paths shared by every cooperating process.
//!
//! The namespace houses one lock file per data directory and the short
//! fallback socket directories used when a data directory path is too long
//! for a Unix domain socket. Library callers and the CLI must agree on this
//! layout or they will not serialise against each other.

use std::fs::DirBuilder;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

/// Canonical paths inside the coordination namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationPaths {
    runtime_dir: PathBuf,
    locks_dir: PathBuf,
    sockets_dir: PathBuf,
}

impl CoordinationPaths {
    /// Derives the namespace from configuration and creates its directories.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimePathsError::RuntimeDirectory`] when a directory cannot
    /// be created.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let paths = Self::from_config_readonly(config);
        for dir in [&paths.runtime_dir, &paths.locks_dir, &paths.sockets_dir] {
            create_private_dir(dir)?;
        }
        Ok(paths)
    }

    /// Derives the namespace without touching the filesystem.
    #[must_use]
    pub fn from_config_readonly(config: &Config) -> Self {
        let runtime_dir = config.runtime_dir().into_std_path_buf();
        Self {
            locks_dir: runtime_dir.join("locks"),
            sockets_dir: runtime_dir.join("sockets"),
            runtime_dir,
        }
    }

    /// Root of the coordination namespace.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        self.runtime_dir.as_path()
    }

    /// Directory holding one lock file per data directory.
    #[must_use]
    pub fn locks_dir(&self) -> &Path {
        self.locks_dir.as_path()
    }

    /// Base directory for hashed fallback socket directories.
    #[must_use]
    pub fn sockets_dir(&self) -> &Path {
        self.sockets_dir.as_path()
    }
}

fn create_private_dir(path: &Path) -> Result<(), RuntimePathsError> {
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
        Err(source) => Err(RuntimePathsError::RuntimeDirectory {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Errors raised while preparing the coordination namespace.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// Creating a namespace directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
