//! Process-table liveness probing.
//!
//! A zero signal asks the kernel whether `pid` names a live process without
//! affecting it. The answer is best-effort: the kernel recycles pids, so a
//! long-dead server's pid can later name an unrelated process. Callers that
//! need certainty must corroborate with other evidence (the status marker's
//! data directory, the socket file).

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;

const LIVENESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::liveness");

/// Returns `true` when a process with `pid` currently exists.
///
/// `EPERM` counts as alive: the process exists but belongs to another user.
/// Pid `0` and values outside the platform's `pid_t` range are never alive.
#[must_use]
pub fn is_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(errno) => {
            debug!(
                target: LIVENESS_TARGET,
                pid,
                %errno,
                "liveness check failed; treating process as absent"
            );
            false
        }
    }
}
