//! Best-effort release of held servers when a process ends.
//!
//! Neither hook runs when the process is killed with `SIGKILL` or aborts.
//! Owner ids left behind by such processes stay in the refcount record; they
//! are reported on later acquisitions but never pruned, so a server whose
//! holder died uncleanly keeps running until stopped explicitly.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use ortho_config::OrthoConfig;
use tracing::{debug, warn};

use pgshare_config::Config;

use crate::coordinator::{CleanupPolicy, Coordinator, LIFECYCLE_TARGET};
use crate::errors::LifecycleError;
use crate::handle::ServerHandle;

static DEFAULT_COORDINATOR: OnceCell<Arc<Coordinator>> = OnceCell::new();

/// Runs [`Coordinator::release_all`] when dropped.
#[derive(Debug)]
#[must_use = "the guard releases servers when it is dropped"]
pub struct ExitGuard {
    coordinator: Arc<Coordinator>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        debug!(target: LIFECYCLE_TARGET, "exit guard releasing held servers");
        self.coordinator.release_all();
    }
}

impl Coordinator {
    /// Returns a guard that releases everything this coordinator holds when
    /// it goes out of scope, typically at the end of `main`.
    pub fn exit_guard(self: &Arc<Self>) -> ExitGuard {
        ExitGuard {
            coordinator: Arc::clone(self),
        }
    }
}

/// Process-wide coordinator configured from `PGSHARE_*` variables and
/// configuration files. Its servers are released from an `atexit` hook.
///
/// # Errors
///
/// Returns [`LifecycleError`] when configuration cannot be loaded or the
/// coordination namespace cannot be created.
pub fn default_coordinator() -> Result<Arc<Coordinator>, LifecycleError> {
    DEFAULT_COORDINATOR
        .get_or_try_init(|| {
            let config = Config::load_from_iter([OsString::from(env!("CARGO_PKG_NAME"))])?;
            let coordinator = Coordinator::new(config)?;
            register_exit_hook();
            Ok(coordinator)
        })
        .map(Arc::clone)
}

/// Acquires the server for `data_dir` through [`default_coordinator`].
///
/// # Errors
///
/// Propagates [`default_coordinator`] and [`Coordinator::acquire`] failures.
pub fn get_server(
    data_dir: impl AsRef<Path>,
    policy: CleanupPolicy,
) -> Result<ServerHandle, LifecycleError> {
    default_coordinator()?.acquire(data_dir, policy)
}

extern "C" fn release_default_at_exit() {
    if let Some(coordinator) = DEFAULT_COORDINATOR.get() {
        coordinator.release_all();
    }
}

fn register_exit_hook() {
    // SAFETY: the handler is a plain `extern "C"` function that does not
    // unwind; `atexit` only records its address.
    let status = unsafe { libc::atexit(release_default_at_exit) };
    if status != 0 {
        warn!(
            target: LIFECYCLE_TARGET,
            status,
            "could not register exit hook; held servers will not be released at exit"
        );
    }
}
