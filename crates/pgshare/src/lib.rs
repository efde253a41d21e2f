//! Coordinated sharing of PostgreSQL servers between processes.
//!
//! Any number of processes on one host may ask for "the server for data
//! directory D". The first caller initialises D and starts the server;
//! later callers, in this process or others, reuse it. Each process records
//! itself in a refcount file inside D while it holds the server, and the
//! last process to release applies the [`CleanupPolicy`] chosen at first
//! acquisition: leave the server running, stop it, or stop it and delete D.
//!
//! Coordination relies only on the filesystem and the process table. An
//! advisory lock per data directory, kept in a shared runtime namespace,
//! serialises every start, stop, and refcount update. The server's own
//! `postmaster.pid` marker tells whether it runs; a marker naming a dead
//! process is treated as stale and a fresh start is attempted.
//!
//! ```no_run
//! use pgshare::{CleanupPolicy, get_server};
//!
//! # fn main() -> Result<(), pgshare::LifecycleError> {
//! let server = get_server("/tmp/pgshare-demo", CleanupPolicy::Stop)?;
//! println!("{}", server.uri(None));
//! let rows = server.run_query("select 1;")?;
//! println!("{rows}");
//! server.release()?;
//! # Ok(())
//! # }
//! ```

pub mod commands;
mod coordinator;
mod errors;
mod exit;
mod handle;
pub mod liveness;
pub mod lock;
pub mod refcount;
pub mod socket;
pub mod status;
pub mod telemetry;

pub use commands::{
    CommandFailure, CommandOutput, PgBinaries, ServerCommands, ServerStatus, StartRequest,
    StopMode, StopOutcome,
};
pub use coordinator::{CleanupPolicy, Coordinator, Inspection, inspect};
pub use errors::LifecycleError;
pub use exit::{ExitGuard, default_coordinator, get_server};
pub use handle::{ServerHandle, connection_uri};
pub use status::{MarkerStatus, ServerState, StatusMarker};

#[cfg(test)]
mod tests;
