use camino::Utf8PathBuf;
use std::env;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

/// Superuser created by `initdb` unless configured otherwise.
pub const DEFAULT_SUPERUSER: &str = "postgres";

/// Default bound on waiting for the cross-process lock. Covers a cold
/// `initdb` followed by a server start on slow disks.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 120_000;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Owned superuser name.
#[must_use]
pub fn default_superuser_string() -> String {
    DEFAULT_SUPERUSER.to_owned()
}

/// Default logging format for the binaries.
#[must_use]
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Computes the default coordination namespace.
///
/// Prefers `$XDG_RUNTIME_DIR/pgshare`. Without a runtime directory the path
/// falls back to the temporary directory namespaced by effective uid so that
/// users sharing `/tmp` never contend on each other's locks.
#[must_use]
pub fn default_runtime_directory() -> Utf8PathBuf {
    default_runtime_directory_inner()
}

#[cfg(unix)]
fn default_runtime_directory_inner() -> Utf8PathBuf {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("pgshare");
    if apply_namespace {
        base.push(user_namespace());
    }
    base
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    // SAFETY: `geteuid` has no preconditions and cannot fail.
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn default_runtime_directory_inner() -> Utf8PathBuf {
    let mut base = fallback_base_directory();
    base.push("pgshare");
    base
}
