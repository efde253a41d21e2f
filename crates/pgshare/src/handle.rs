//! Scoped access to a shared server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::warn;

use crate::commands::ServerStatus;
use crate::coordinator::{CleanupPolicy, Coordinator, LIFECYCLE_TARGET, SharedServer};
use crate::errors::LifecycleError;
use crate::socket::DEFAULT_PORT;
use crate::status;

/// Characters escaped inside URI components. Path separators stay readable
/// so socket directories remain recognisable in logs.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Builds a libpq connection URI that reaches the server through its Unix
/// socket directory.
#[must_use]
pub fn connection_uri(user: &str, database: &str, socket_dir: &Path, port: u16) -> String {
    let mut uri = format!(
        "postgresql://{}:@/{}?host={}",
        utf8_percent_encode(user, COMPONENT),
        utf8_percent_encode(database, COMPONENT),
        utf8_percent_encode(&socket_dir.to_string_lossy(), COMPONENT),
    );
    if port != DEFAULT_PORT {
        uri.push_str(&format!("&port={port}"));
    }
    uri
}

/// Holder of one reference to a shared server.
///
/// Dropping the handle releases the reference and logs any failure; call
/// [`ServerHandle::release`] to observe the result instead. Handles obtained
/// for the same data directory in one process share a single server object.
#[derive(Debug)]
pub struct ServerHandle {
    coordinator: Arc<Coordinator>,
    server: Arc<SharedServer>,
    released: bool,
}

impl ServerHandle {
    pub(crate) const fn new(coordinator: Arc<Coordinator>, server: Arc<SharedServer>) -> Self {
        Self {
            coordinator,
            server,
            released: false,
        }
    }

    /// Canonical data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        self.server.data_dir()
    }

    /// Directory holding the server socket.
    #[must_use]
    pub fn socket_dir(&self) -> PathBuf {
        self.server.endpoint().socket_dir
    }

    /// Server port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.server.endpoint().port
    }

    /// Cleanup policy fixed at first acquisition.
    #[must_use]
    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.server.policy()
    }

    /// Whether both handles refer to the same shared server object.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.server, &other.server)
    }

    /// Pid from the status marker, or `None` when the server is not running.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Status`] when the marker cannot be read.
    pub fn pid(&self) -> Result<Option<u32>, LifecycleError> {
        Ok(status::running_pid(self.data_dir())?)
    }

    /// Connection URI for `database`, defaulting to the superuser's database.
    #[must_use]
    pub fn uri(&self, database: Option<&str>) -> String {
        let user = self.coordinator.config().superuser();
        let endpoint = self.server.endpoint();
        connection_uri(
            user,
            database.unwrap_or(user),
            &endpoint.socket_dir,
            endpoint.port,
        )
    }

    /// Runs `sql` through `psql` and returns its standard output.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Command`] with the captured invocation when
    /// `psql` fails.
    pub fn run_query(&self, sql: &str) -> Result<String, LifecycleError> {
        self.coordinator
            .commands()
            .query(&self.uri(None), sql)
            .map_err(|source| LifecycleError::Command {
                program: "psql",
                source,
            })
    }

    /// Asks `pg_ctl` whether the server is running.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Command`] when `pg_ctl status` fails
    /// unexpectedly.
    pub fn status(&self) -> Result<ServerStatus, LifecycleError> {
        self.coordinator
            .commands()
            .status(self.data_dir())
            .map_err(|source| LifecycleError::Command {
                program: "pg_ctl",
                source,
            })
    }

    /// Releases this reference now and reports the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the lock or refcount record cannot be
    /// used. Failing to stop the server is logged, not returned.
    pub fn release(mut self) -> Result<(), LifecycleError> {
        self.released = true;
        self.coordinator.release(&self.server)
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(error) = self.coordinator.release(&self.server) {
            warn!(
                target: LIFECYCLE_TARGET,
                data_dir = %self.server.data_dir().display(),
                %error,
                "release on drop failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::default_port(
        "postgres",
        "postgres",
        "/tmp/pg",
        DEFAULT_PORT,
        "postgresql://postgres:@/postgres?host=/tmp/pg"
    )]
    #[case::custom_port(
        "postgres",
        "app",
        "/tmp/pg",
        6543,
        "postgresql://postgres:@/app?host=/tmp/pg&port=6543"
    )]
    #[case::escaped(
        "ops team",
        "a&b",
        "/tmp/with space",
        DEFAULT_PORT,
        "postgresql://ops%20team:@/a%26b?host=/tmp/with%20space"
    )]
    fn builds_socket_uris(
        #[case] user: &str,
        #[case] database: &str,
        #[case] socket_dir: &str,
        #[case] port: u16,
        #[case] expected: &str,
    ) {
        assert_eq!(
            connection_uri(user, database, Path::new(socket_dir), port),
            expected
        );
    }
}
