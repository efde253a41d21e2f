//! Shared configuration for the pgshare lifecycle coordinator and its CLI.
//!
//! Configuration is layered by `ortho_config`: defaults, then a configuration
//! file, then `PGSHARE_*` environment variables, then command-line flags. The
//! coordinator and the `pgshare` binary both read the same [`Config`] so that
//! every cooperating process agrees on where the coordination namespace lives.
//! Processes that disagree on `runtime_dir` do not see each other's locks.

mod defaults;
mod logging;
mod runtime;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_LOG_FILTER, DEFAULT_SUPERUSER,
    default_log_filter_string, default_log_format, default_runtime_directory,
    default_superuser_string,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use runtime::{CoordinationPaths, RuntimePathsError};

/// Settings shared by every process that coordinates PostgreSQL servers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "PGSHARE")]
pub struct Config {
    /// Directory holding `initdb`, `pg_ctl`, and `psql`. Looked up on `PATH`
    /// when unset.
    pub bin_dir: Option<Utf8PathBuf>,
    /// Coordination namespace for lock files and fallback socket directories.
    pub runtime_dir: Option<Utf8PathBuf>,
    /// Superuser created at initialisation and embedded in connection URIs.
    #[ortho_config(default = default_superuser_string())]
    pub superuser: String,
    /// Whether the server also listens on a loopback TCP port.
    #[ortho_config(default = false)]
    pub listen_tcp: bool,
    /// Upper bound, in milliseconds, on waiting for the cross-process lock.
    #[ortho_config(default = DEFAULT_LOCK_TIMEOUT_MS)]
    pub lock_timeout_ms: u64,
    /// Tracing filter expression.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bin_dir: None,
            runtime_dir: None,
            superuser: default_superuser_string(),
            listen_tcp: false,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Directory holding the server binaries, if configured.
    #[must_use]
    pub fn bin_dir(&self) -> Option<&Utf8Path> {
        self.bin_dir.as_deref()
    }

    /// Coordination namespace, falling back to the per-user default.
    #[must_use]
    pub fn runtime_dir(&self) -> Utf8PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(default_runtime_directory)
    }

    /// Superuser name.
    #[must_use]
    pub fn superuser(&self) -> &str {
        &self.superuser
    }

    /// Whether a loopback TCP listener is requested.
    #[must_use]
    pub const fn listen_tcp(&self) -> bool {
        self.listen_tcp
    }

    /// Bounded wait for the cross-process lock.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}
