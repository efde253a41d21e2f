//! Acquisition and release of shared servers.
//!
//! A [`Coordinator`] owns the in-process registry of servers and the lock
//! table that serialises this process against itself and against other
//! processes. Every start, stop, and refcount mutation for a data directory
//! happens while its cross-process lock is held.
//!
//! Registry entries move through three phases. `Attached` entries have local
//! handles and a registered owner id. `Releasing` entries have no local
//! handles but are still registered, either because a release is waiting on
//! the lock or because it failed. `Detached` entries are no longer
//! registered; other processes still hold the server, and the next
//! acquisition re-registers and reuses the same object.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, DirBuilder};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use pgshare_config::{Config, CoordinationPaths};

use crate::commands::{
    PgBinaries, ServerCommands, StartRequest, StopMode, StopOutcome,
};
use crate::errors::LifecycleError;
use crate::handle::ServerHandle;
use crate::liveness;
use crate::lock::{LockTable, lock_path_for};
use crate::refcount::{OwnerId, RefcountStore};
use crate::socket::{self, DEFAULT_PORT};
use crate::status::{self, ServerState, StatusMarker};

pub(crate) const LIFECYCLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");

/// File `initdb` writes once a data directory is initialised.
const VERSION_FILE_NAME: &str = "PG_VERSION";
/// Server log written by `pg_ctl -l`.
const LOG_FILE_NAME: &str = "log";
const LOG_TAIL_LINES: usize = 20;
const LOOPBACK: &str = "127.0.0.1";

/// Coordinators in this process registered per data directory and owner id.
/// The refcount record holds each owner once, so only the first registration
/// and the last unregistration touch it.
static PROCESS_HOLDS: Lazy<Mutex<HashMap<(PathBuf, OwnerId), usize>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn process_holds() -> MutexGuard<'static, HashMap<(PathBuf, OwnerId), usize>> {
    PROCESS_HOLDS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happens when the last holder of a server releases it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CleanupPolicy {
    /// Leave the server running.
    None,
    /// Stop the server and keep the data directory.
    #[default]
    Stop,
    /// Stop the server and remove the data directory.
    Delete,
}

/// Where clients reach a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub(crate) socket_dir: PathBuf,
    pub(crate) port: u16,
}

impl Endpoint {
    fn from_marker(marker: &StatusMarker, socket_dir: &Path, port: u16) -> Self {
        Self {
            socket_dir: marker
                .socket_dir
                .clone()
                .unwrap_or_else(|| socket_dir.to_path_buf()),
            port: marker.port.unwrap_or(port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Attached,
    Releasing,
    Detached,
}

#[derive(Debug)]
struct Tenancy {
    local_refs: usize,
    phase: Phase,
    endpoint: Endpoint,
}

/// One server shared by every handle on its data directory in this process.
#[derive(Debug)]
pub(crate) struct SharedServer {
    data_dir: PathBuf,
    lock_path: PathBuf,
    policy: CleanupPolicy,
    tenancy: Mutex<Tenancy>,
}

impl SharedServer {
    fn tenancy(&self) -> MutexGuard<'_, Tenancy> {
        self.tenancy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) const fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.tenancy().endpoint.clone()
    }
}

/// Process-wide context coordinating shared servers.
pub struct Coordinator {
    config: Config,
    paths: CoordinationPaths,
    commands: Arc<dyn ServerCommands>,
    locks: LockTable,
    registry: Mutex<HashMap<PathBuf, Arc<SharedServer>>>,
    owner: OwnerId,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Coordinator")
            .field("paths", &self.paths)
            .field("owner", &self.owner)
            .field("lock_timeout", &self.locks.timeout())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Builds a coordinator that runs the installed PostgreSQL binaries.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RuntimePaths`] when the coordination
    /// namespace cannot be created.
    pub fn new(config: Config) -> Result<Arc<Self>, LifecycleError> {
        let binaries = PgBinaries::new(config.bin_dir().map(|dir| dir.as_std_path().to_path_buf()));
        Self::with_commands(config, Arc::new(binaries))
    }

    /// Builds a coordinator over a custom command adapter.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RuntimePaths`] when the coordination
    /// namespace cannot be created.
    pub fn with_commands(
        config: Config,
        commands: Arc<dyn ServerCommands>,
    ) -> Result<Arc<Self>, LifecycleError> {
        Self::build(config, commands, std::process::id())
    }

    #[cfg(test)]
    pub(crate) fn with_owner(
        config: Config,
        commands: Arc<dyn ServerCommands>,
        owner: OwnerId,
    ) -> Result<Arc<Self>, LifecycleError> {
        Self::build(config, commands, owner)
    }

    fn build(
        config: Config,
        commands: Arc<dyn ServerCommands>,
        owner: OwnerId,
    ) -> Result<Arc<Self>, LifecycleError> {
        let paths = CoordinationPaths::from_config(&config)?;
        debug!(
            target: LIFECYCLE_TARGET,
            runtime_dir = %paths.runtime_dir().display(),
            owner,
            "coordinator ready"
        );
        Ok(Arc::new(Self {
            locks: LockTable::new(config.lock_timeout()),
            config,
            paths,
            commands,
            registry: Mutex::new(HashMap::new()),
            owner,
        }))
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Coordination namespace in use.
    #[must_use]
    pub const fn paths(&self) -> &CoordinationPaths {
        &self.paths
    }

    pub(crate) fn commands(&self) -> &dyn ServerCommands {
        self.commands.as_ref()
    }

    /// Returns a handle on the server for `data_dir`, initialising and
    /// starting it when needed.
    ///
    /// Repeat acquisitions in this process return handles on the same shared
    /// object. The cleanup policy is fixed by the first acquisition; a later
    /// differing request is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the data directory is unusable, the
    /// lock stays contended, `initdb` or `pg_ctl start` fails, or the
    /// refcount record cannot be updated.
    pub fn acquire(
        self: &Arc<Self>,
        data_dir: impl AsRef<Path>,
        policy: CleanupPolicy,
    ) -> Result<ServerHandle, LifecycleError> {
        let data_dir = prepare_data_dir(data_dir.as_ref())?;
        if let Some(server) = self.attach_existing(&data_dir, policy) {
            return Ok(ServerHandle::new(Arc::clone(self), server));
        }

        let lock_path = lock_path_for(self.paths.locks_dir(), &data_dir);
        let _lock = self.locks.acquire(&lock_path)?;
        if let Some(server) = self.attach_existing(&data_dir, policy) {
            return Ok(ServerHandle::new(Arc::clone(self), server));
        }

        let existing = self.registry().get(&data_dir).cloned();
        let still_registered = existing
            .as_ref()
            .is_some_and(|server| server.tenancy().phase == Phase::Releasing);
        let endpoint = self.bring_up(&data_dir)?;
        if !still_registered {
            self.register_owner(&data_dir)?;
        }

        let server = match existing {
            Some(server) => {
                let mut tenancy = server.tenancy();
                tenancy.local_refs += 1;
                tenancy.phase = Phase::Attached;
                tenancy.endpoint = endpoint;
                drop(tenancy);
                warn_on_policy_mismatch(&server, policy);
                server
            }
            None => {
                let server = Arc::new(SharedServer {
                    data_dir: data_dir.clone(),
                    lock_path,
                    policy,
                    tenancy: Mutex::new(Tenancy {
                        local_refs: 1,
                        phase: Phase::Attached,
                        endpoint,
                    }),
                });
                self.registry().insert(data_dir.clone(), Arc::clone(&server));
                server
            }
        };
        info!(
            target: LIFECYCLE_TARGET,
            data_dir = %data_dir.display(),
            policy = %server.policy,
            owner = self.owner,
            "server acquired"
        );
        Ok(ServerHandle::new(Arc::clone(self), server))
    }

    /// Drops one local reference; the last one unregisters this process and
    /// applies the cleanup policy when no other process holds the server.
    pub(crate) fn release(&self, server: &Arc<SharedServer>) -> Result<(), LifecycleError> {
        {
            let mut tenancy = server.tenancy();
            if tenancy.local_refs == 0 {
                debug!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %server.data_dir.display(),
                    "server already released"
                );
                return Ok(());
            }
            tenancy.local_refs -= 1;
            if tenancy.local_refs > 0 {
                debug!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %server.data_dir.display(),
                    local_refs = tenancy.local_refs,
                    "nested handle released"
                );
                return Ok(());
            }
            tenancy.phase = Phase::Releasing;
        }
        self.finish_release(server)
    }

    /// Releases every server this coordinator still holds, regardless of
    /// outstanding handles. Failures are logged.
    pub fn release_all(&self) {
        let servers: Vec<Arc<SharedServer>> = self.registry().values().cloned().collect();
        for server in servers {
            let pending = {
                let mut tenancy = server.tenancy();
                match tenancy.phase {
                    Phase::Attached | Phase::Releasing => {
                        tenancy.local_refs = 0;
                        tenancy.phase = Phase::Releasing;
                        true
                    }
                    Phase::Detached => false,
                }
            };
            if pending && let Err(error) = self.finish_release(&server) {
                warn!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %server.data_dir.display(),
                    %error,
                    "deferred release failed"
                );
            }
        }
    }

    /// Stops the server for `data_dir` outside the refcount protocol.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StillHeld`] when owners are registered and
    /// `force` is unset, and [`LifecycleError::StopFailed`] when `pg_ctl`
    /// fails for a reason other than the server not running.
    pub fn stop(
        &self,
        data_dir: impl AsRef<Path>,
        mode: StopMode,
        force: bool,
    ) -> Result<StopOutcome, LifecycleError> {
        let data_dir = canonical_data_dir(data_dir.as_ref())?;
        let _lock = self
            .locks
            .acquire(&lock_path_for(self.paths.locks_dir(), &data_dir))?;
        let owners = RefcountStore::for_data_dir(&data_dir).read()?;
        if !owners.is_empty() {
            if !force {
                return Err(LifecycleError::StillHeld {
                    data_dir,
                    owners: owners.into_iter().collect(),
                });
            }
            warn!(
                target: LIFECYCLE_TARGET,
                data_dir = %data_dir.display(),
                ?owners,
                "stopping a server that is still held"
            );
        }
        match StopOutcome::classify(self.commands.stop(&data_dir, mode)) {
            StopOutcome::Failed(source) => Err(LifecycleError::StopFailed { data_dir, source }),
            outcome => Ok(outcome),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<SharedServer>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach_existing(&self, data_dir: &Path, policy: CleanupPolicy) -> Option<Arc<SharedServer>> {
        let server = self.registry().get(data_dir).cloned()?;
        let mut tenancy = server.tenancy();
        if tenancy.phase != Phase::Attached {
            return None;
        }
        tenancy.local_refs += 1;
        debug!(
            target: LIFECYCLE_TARGET,
            data_dir = %data_dir.display(),
            local_refs = tenancy.local_refs,
            "reusing registered server"
        );
        drop(tenancy);
        warn_on_policy_mismatch(&server, policy);
        Some(server)
    }

    fn bring_up(&self, data_dir: &Path) -> Result<Endpoint, LifecycleError> {
        self.ensure_initialised(data_dir)?;
        match status::server_state(data_dir)? {
            ServerState::Running(marker) => {
                info!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %data_dir.display(),
                    pid = marker.pid,
                    "reusing running server"
                );
                return Ok(Endpoint::from_marker(&marker, data_dir, DEFAULT_PORT));
            }
            ServerState::Stale { reason } => info!(
                target: LIFECYCLE_TARGET,
                data_dir = %data_dir.display(),
                %reason,
                "starting over stale status marker"
            ),
            ServerState::Absent => {}
        }
        self.start(data_dir)
    }

    fn ensure_initialised(&self, data_dir: &Path) -> Result<(), LifecycleError> {
        if data_dir.join(VERSION_FILE_NAME).is_file() {
            return Ok(());
        }
        info!(
            target: LIFECYCLE_TARGET,
            data_dir = %data_dir.display(),
            "initialising data directory"
        );
        self.commands
            .init(data_dir, self.config.superuser())
            .map(drop)
            .map_err(|source| LifecycleError::InitializationFailed {
                data_dir: data_dir.to_path_buf(),
                source,
            })
    }

    fn start(&self, data_dir: &Path) -> Result<Endpoint, LifecycleError> {
        let (port, listen_address) = if self.config.listen_tcp() {
            let port = socket::find_free_port(LOOPBACK)
                .map_err(|source| LifecycleError::Port { source })?;
            (port, Some(LOOPBACK.to_owned()))
        } else {
            (DEFAULT_PORT, None)
        };
        let socket_dir = socket::resolve_socket_dir(data_dir, self.paths.sockets_dir(), port)
            .map_err(|source| LifecycleError::SocketPathUnavailable {
                data_dir: data_dir.to_path_buf(),
                source,
            })?;
        let request = StartRequest {
            data_dir: data_dir.to_path_buf(),
            socket_dir: socket_dir.clone(),
            log_file: data_dir.join(LOG_FILE_NAME),
            listen_address,
            port,
        };
        info!(
            target: LIFECYCLE_TARGET,
            data_dir = %data_dir.display(),
            socket_dir = %socket_dir.display(),
            port,
            "starting server"
        );
        if let Err(failure) = self.commands.start(&request) {
            return Err(startup_failed(data_dir, failure.to_string()));
        }
        match status::server_state(data_dir)? {
            ServerState::Running(marker) => {
                info!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %data_dir.display(),
                    pid = marker.pid,
                    "server started"
                );
                Ok(Endpoint::from_marker(&marker, &socket_dir, port))
            }
            ServerState::Absent | ServerState::Stale { .. } => Err(startup_failed(
                data_dir,
                "start reported success but no live server process is recorded".to_owned(),
            )),
        }
    }

    fn finish_release(&self, server: &Arc<SharedServer>) -> Result<(), LifecycleError> {
        let lock = self.locks.acquire(&server.lock_path)?;
        if server.tenancy().phase != Phase::Releasing {
            debug!(
                target: LIFECYCLE_TARGET,
                data_dir = %server.data_dir.display(),
                "release superseded by a newer acquisition"
            );
            return Ok(());
        }
        let data_dir = server.data_dir.as_path();
        if !data_dir.is_dir() {
            warn!(
                target: LIFECYCLE_TARGET,
                data_dir = %data_dir.display(),
                "data directory disappeared while held; skipping cleanup"
            );
            if let Err(error) = self.unregister_owner(data_dir) {
                debug!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %data_dir.display(),
                    %error,
                    "could not unregister from a missing data directory"
                );
            }
            self.forget(server);
            return Ok(());
        }

        let remaining = self.unregister_owner(data_dir)?;
        if !remaining.is_empty() {
            self.report_dead_owners(data_dir, &remaining);
            info!(
                target: LIFECYCLE_TARGET,
                data_dir = %data_dir.display(),
                holders = remaining.len(),
                "server still held by other processes"
            );
            server.tenancy().phase = Phase::Detached;
            return Ok(());
        }

        let outcome = self.apply_policy(server);
        if server.policy == CleanupPolicy::Delete
            && !data_dir.exists()
            && let Err(error) = lock.remove_file()
        {
            debug!(
                target: LIFECYCLE_TARGET,
                file = %lock.path().display(),
                %error,
                "could not remove lock file"
            );
        }
        self.forget(server);
        outcome
    }

    fn apply_policy(&self, server: &SharedServer) -> Result<(), LifecycleError> {
        let data_dir = server.data_dir.as_path();
        match server.policy {
            CleanupPolicy::None => {
                info!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %data_dir.display(),
                    "last holder released; leaving server running"
                );
                Ok(())
            }
            CleanupPolicy::Stop => {
                self.stop_quietly(data_dir);
                Ok(())
            }
            CleanupPolicy::Delete => {
                if !self.stop_quietly(data_dir).is_stopped() {
                    warn!(
                        target: LIFECYCLE_TARGET,
                        data_dir = %data_dir.display(),
                        "server did not stop; keeping data directory"
                    );
                    return Ok(());
                }
                self.remove_fallback_socket_dir(&server.endpoint().socket_dir, data_dir);
                fs::remove_dir_all(data_dir).map_err(|source| LifecycleError::DataDirectory {
                    path: data_dir.to_path_buf(),
                    source,
                })?;
                info!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %data_dir.display(),
                    "data directory removed"
                );
                Ok(())
            }
        }
    }

    fn stop_quietly(&self, data_dir: &Path) -> StopOutcome {
        let outcome = match StopOutcome::classify(self.commands.stop(data_dir, StopMode::Fast)) {
            StopOutcome::Failed(error) if !server_still_running(data_dir) => {
                debug!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %data_dir.display(),
                    %error,
                    "stop failed but no live server remains"
                );
                StopOutcome::NotRunning
            }
            outcome => outcome,
        };
        match &outcome {
            StopOutcome::Stopped => info!(
                target: LIFECYCLE_TARGET,
                data_dir = %data_dir.display(),
                "server stopped"
            ),
            StopOutcome::NotRunning => info!(
                target: LIFECYCLE_TARGET,
                data_dir = %data_dir.display(),
                "server was not running"
            ),
            StopOutcome::Failed(error) => warn!(
                target: LIFECYCLE_TARGET,
                data_dir = %data_dir.display(),
                %error,
                "failed to stop server"
            ),
        }
        outcome
    }

    fn remove_fallback_socket_dir(&self, socket_dir: &Path, data_dir: &Path) {
        if socket_dir == data_dir || !socket_dir.starts_with(self.paths.sockets_dir()) {
            return;
        }
        if let Err(error) = fs::remove_dir_all(socket_dir)
            && error.kind() != io::ErrorKind::NotFound
        {
            debug!(
                target: LIFECYCLE_TARGET,
                dir = %socket_dir.display(),
                %error,
                "could not remove fallback socket directory"
            );
        }
    }

    fn forget(&self, server: &Arc<SharedServer>) {
        server.tenancy().phase = Phase::Detached;
        let mut registry = self.registry();
        if registry
            .get(&server.data_dir)
            .is_some_and(|entry| Arc::ptr_eq(entry, server))
        {
            registry.remove(&server.data_dir);
        }
    }

    fn register_owner(&self, data_dir: &Path) -> Result<(), LifecycleError> {
        let key = (data_dir.to_path_buf(), self.owner);
        let mut holds = process_holds();
        let coordinators = holds.get(&key).copied().unwrap_or(0);
        if coordinators == 0 {
            let owners = RefcountStore::for_data_dir(data_dir).add(self.owner)?;
            self.report_dead_owners(data_dir, &owners);
        } else {
            debug!(
                target: LIFECYCLE_TARGET,
                data_dir = %data_dir.display(),
                coordinators,
                "owner already registered by this process"
            );
        }
        holds.insert(key, coordinators + 1);
        Ok(())
    }

    /// Returns the owners left on record, which include this process while
    /// another of its coordinators still holds the server.
    fn unregister_owner(&self, data_dir: &Path) -> Result<BTreeSet<OwnerId>, LifecycleError> {
        let key = (data_dir.to_path_buf(), self.owner);
        let mut holds = process_holds();
        let store = RefcountStore::for_data_dir(data_dir);
        match holds.get(&key).copied() {
            Some(coordinators) if coordinators > 1 => {
                holds.insert(key, coordinators - 1);
                Ok(store.read()?)
            }
            _ => {
                let remaining = store.remove(self.owner)?;
                holds.remove(&key);
                Ok(remaining)
            }
        }
    }

    fn report_dead_owners(&self, data_dir: &Path, owners: &BTreeSet<OwnerId>) {
        for &owner in owners {
            if owner != self.owner && !liveness::is_running(owner) {
                warn!(
                    target: LIFECYCLE_TARGET,
                    data_dir = %data_dir.display(),
                    owner,
                    "refcount record names a process that is gone"
                );
            }
        }
    }
}

fn warn_on_policy_mismatch(server: &SharedServer, requested: CleanupPolicy) {
    if server.policy != requested {
        warn!(
            target: LIFECYCLE_TARGET,
            data_dir = %server.data_dir.display(),
            kept = %server.policy,
            requested = %requested,
            "cleanup policy differs from first acquisition; keeping the original"
        );
    }
}

/// A crashed server leaves a marker naming a dead pid, which `pg_ctl stop`
/// reports as a failure. Only a marker with a live pid counts as running;
/// an unreadable marker is assumed running so the directory is kept.
fn server_still_running(data_dir: &Path) -> bool {
    !matches!(
        status::server_state(data_dir),
        Ok(ServerState::Absent | ServerState::Stale { .. })
    )
}

fn startup_failed(data_dir: &Path, reason: String) -> LifecycleError {
    LifecycleError::StartupFailed {
        data_dir: data_dir.to_path_buf(),
        reason,
        log_tail: log_tail(data_dir),
    }
}

/// Last lines of the server log, or a note when it cannot be read.
pub(crate) fn log_tail(data_dir: &Path) -> String {
    let path = data_dir.join(LOG_FILE_NAME);
    match fs::read_to_string(&path) {
        Ok(content) => {
            let lines: Vec<&str> = content.lines().collect();
            lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n")
        }
        Err(error) => format!("<server log '{}' unavailable: {error}>", path.display()),
    }
}

fn prepare_data_dir(path: &Path) -> Result<PathBuf, LifecycleError> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    match builder.create(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
        Err(source) => {
            return Err(LifecycleError::DataDirectory {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    canonical_data_dir(path)
}

fn canonical_data_dir(path: &Path) -> Result<PathBuf, LifecycleError> {
    fs::canonicalize(path).map_err(|source| LifecycleError::DataDirectory {
        path: path.to_path_buf(),
        source,
    })
}

/// Lock-free snapshot of a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    /// Canonical data directory.
    pub data_dir: PathBuf,
    /// Whether `initdb` has run.
    pub initialised: bool,
    /// Server state derived from the status marker.
    pub state: ServerState,
    /// Registered owners.
    pub owners: BTreeSet<OwnerId>,
}

/// Reads the marker and refcount record of `data_dir` without locking.
/// Concurrent holders may change either between the two reads.
///
/// # Errors
///
/// Returns [`LifecycleError`] when the directory does not exist or either
/// record cannot be read.
pub fn inspect(data_dir: impl AsRef<Path>) -> Result<Inspection, LifecycleError> {
    let data_dir = canonical_data_dir(data_dir.as_ref())?;
    let state = status::server_state(&data_dir)?;
    let owners = RefcountStore::for_data_dir(&data_dir).read()?;
    Ok(Inspection {
        initialised: data_dir.join(VERSION_FILE_NAME).is_file(),
        data_dir,
        state,
        owners,
    })
}
