//! Cross-process advisory locking scoped to a data directory.
//!
//! Each data directory maps to one lock file in the coordination namespace.
//! An exclusive `flock` on that file serialises processes; an in-process
//! table serialises threads and lets the holding thread re-enter. `flock`
//! locks belong to open file descriptions, so without the table two threads
//! of one process would contend through separate descriptors and a
//! re-entrant call would deadlock against itself.
//!
//! A lock file may be unlinked while held, once its data directory is gone.
//! A waiter that then wins the `flock` on the orphaned inode notices that the
//! path no longer names it and starts over on a fresh file.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

const LOCK_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lock");
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Errors raised while taking a cross-process lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed contended for the whole wait budget.
    #[error("lock '{path}' still held by another holder after {timeout:?}")]
    Unavailable {
        /// Lock file path.
        path: PathBuf,
        /// Wait budget that elapsed.
        timeout: Duration,
    },
    /// Opening or locking the file failed.
    #[error("failed to lock '{path}': {source}")]
    Io {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Returns the lock file guarding `data_dir` inside `locks_dir`.
#[must_use]
pub fn lock_path_for(locks_dir: &Path, data_dir: &Path) -> PathBuf {
    let digest = Sha256::digest(data_dir.as_os_str().as_encoded_bytes());
    let mut name: String = digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    name.push_str(".lock");
    locks_dir.join(name)
}

/// Identity of the calling thread. `thread::current` is unusable in exit
/// hooks once thread-local storage has been torn down, so this asks pthreads.
fn current_thread() -> libc::pthread_t {
    // SAFETY: `pthread_self` has no preconditions and cannot fail.
    unsafe { libc::pthread_self() }
}

#[derive(Debug)]
struct Holder {
    thread: libc::pthread_t,
    depth: usize,
    file: Option<File>,
}

/// Re-entrant table of cross-process locks held by this process.
#[derive(Debug)]
pub struct LockTable {
    timeout: Duration,
    holders: Mutex<HashMap<PathBuf, Holder>>,
    released: Condvar,
}

impl LockTable {
    /// Builds an empty table with the given wait budget.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            holders: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Wait budget for each acquisition.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Takes the lock at `path`, re-entering if this thread already holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] when the budget elapses and
    /// [`LockError::Io`] when the file cannot be opened or locked.
    pub fn acquire(&self, path: &Path) -> Result<LockGuard<'_>, LockError> {
        let me = current_thread();
        let deadline = Instant::now() + self.timeout;
        let mut holders = self.holders();
        loop {
            match holders.get_mut(path) {
                Some(holder) if holder.thread == me => {
                    holder.depth += 1;
                    debug!(
                        target: LOCK_TARGET,
                        file = %path.display(),
                        depth = holder.depth,
                        "re-entered lock"
                    );
                    return Ok(self.guard(path));
                }
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.unavailable(path));
                    }
                    holders = self
                        .released
                        .wait_timeout(holders, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    holders.insert(
                        path.to_path_buf(),
                        Holder {
                            thread: me,
                            depth: 1,
                            file: None,
                        },
                    );
                    break;
                }
            }
        }
        drop(holders);

        match self.lock_file(path, deadline) {
            Ok(file) => {
                if let Some(holder) = self.holders().get_mut(path) {
                    holder.file = Some(file);
                }
                debug!(target: LOCK_TARGET, file = %path.display(), "acquired lock");
                Ok(self.guard(path))
            }
            Err(error) => {
                self.holders().remove(path);
                self.released.notify_all();
                Err(error)
            }
        }
    }

    fn guard(&self, path: &Path) -> LockGuard<'_> {
        LockGuard {
            table: self,
            path: path.to_path_buf(),
        }
    }

    fn unavailable(&self, path: &Path) -> LockError {
        LockError::Unavailable {
            path: path.to_path_buf(),
            timeout: self.timeout,
        }
    }

    fn holders(&self) -> MutexGuard<'_, HashMap<PathBuf, Holder>> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_file(&self, path: &Path, deadline: Instant) -> Result<File, LockError> {
        let io_error = |source: io::Error| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let contended = fs2::lock_contended_error().raw_os_error();
        let mut backoff = INITIAL_BACKOFF;
        let mut file = options.open(path).map_err(io_error)?;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) if still_linked(&file, path).map_err(io_error)? => return Ok(file),
                Ok(()) => {
                    debug!(
                        target: LOCK_TARGET,
                        file = %path.display(),
                        "lock file was removed while waiting; reopening"
                    );
                    file = options.open(path).map_err(io_error)?;
                }
                Err(error) if error.raw_os_error() == contended => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            target: LOCK_TARGET,
                            file = %path.display(),
                            timeout_ms = self.timeout.as_millis(),
                            "gave up waiting for lock"
                        );
                        return Err(self.unavailable(path));
                    }
                    thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(source) => return Err(io_error(source)),
            }
        }
    }

    fn release(&self, path: &Path) {
        let mut holders = self.holders();
        let Some(holder) = holders.get_mut(path) else {
            return;
        };
        holder.depth = holder.depth.saturating_sub(1);
        if holder.depth > 0 {
            return;
        }
        if let Some(holder) = holders.remove(path)
            && let Some(file) = holder.file
            && let Err(error) = FileExt::unlock(&file)
        {
            warn!(
                target: LOCK_TARGET,
                file = %path.display(),
                %error,
                "failed to unlock; closing the descriptor releases it"
            );
        }
        drop(holders);
        self.released.notify_all();
        debug!(target: LOCK_TARGET, file = %path.display(), "released lock");
    }
}

/// Whether `path` still names the inode `file` has open.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    table: &'a LockTable,
    path: PathBuf,
}

impl LockGuard<'_> {
    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlinks the lock file while the lock is still held. Later acquisitions
    /// create a fresh file; current waiters detect the removal and retry.
    ///
    /// # Errors
    ///
    /// Returns the IO error from unlinking, except when the file is already
    /// gone.
    pub fn remove_file(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
            _ => {
                debug!(target: LOCK_TARGET, file = %self.path.display(), "removed lock file");
                Ok(())
            }
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.path);
    }
}
