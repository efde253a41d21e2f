//! Disk-persisted set of processes holding a data directory.
//!
//! The record is a JSON array of owner ids stored inside the data directory.
//! Every mutation must happen under the cross-process lock for that
//! directory; the store itself performs no locking. Writes replace the file
//! atomically so a crash mid-write leaves either the old or the new set.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

const REFCOUNT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::refcount");

/// Filename of the refcount record inside a data directory.
pub const REFCOUNT_FILE_NAME: &str = ".pgshare_owners.json";

/// Identifier of a holder; the holding process id.
pub type OwnerId = u32;

/// Errors raised by the refcount store.
#[derive(Debug, Error)]
pub enum RefcountError {
    /// Reading the record failed.
    #[error("failed to read refcount record '{path}': {source}")]
    Read {
        /// Record path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The record did not contain a JSON array of owner ids.
    #[error("refcount record '{path}' is malformed: {source}")]
    Malformed {
        /// Record path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// Writing the record failed.
    #[error("failed to write refcount record '{path}': {source}")]
    Write {
        /// Record path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// An owner tried to register twice. This is a coordinator bug.
    #[error("owner {owner} is already registered in '{path}'")]
    DuplicateOwner {
        /// Owner that was already present.
        owner: OwnerId,
        /// Record path.
        path: PathBuf,
    },
}

/// Handle on the refcount record of one data directory.
#[derive(Debug, Clone)]
pub struct RefcountStore {
    path: PathBuf,
}

impl RefcountStore {
    /// Builds a store for the record inside `data_dir`.
    #[must_use]
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(REFCOUNT_FILE_NAME),
        }
    }

    /// Location of the record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current owner set. A missing record is an empty set.
    ///
    /// # Errors
    ///
    /// Returns [`RefcountError::Read`] or [`RefcountError::Malformed`].
    pub fn read(&self) -> Result<BTreeSet<OwnerId>, RefcountError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(source) => {
                return Err(RefcountError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(BTreeSet::new());
        }
        let owners: Vec<OwnerId> =
            serde_json::from_str(&content).map_err(|source| RefcountError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        Ok(owners.into_iter().collect())
    }

    /// Registers `owner` and returns the resulting set.
    ///
    /// # Errors
    ///
    /// Returns [`RefcountError::DuplicateOwner`] when `owner` is already
    /// present; the record is left untouched.
    pub fn add(&self, owner: OwnerId) -> Result<BTreeSet<OwnerId>, RefcountError> {
        let mut owners = self.read()?;
        if !owners.insert(owner) {
            return Err(RefcountError::DuplicateOwner {
                owner,
                path: self.path.clone(),
            });
        }
        self.write(&owners)?;
        debug!(
            target: REFCOUNT_TARGET,
            owner,
            holders = owners.len(),
            file = %self.path.display(),
            "owner registered"
        );
        Ok(owners)
    }

    /// Unregisters `owner` and returns the remaining set.
    ///
    /// Removing an absent owner returns the current set without rewriting the
    /// record, so repeated releases are harmless.
    ///
    /// # Errors
    ///
    /// Propagates read and write failures.
    pub fn remove(&self, owner: OwnerId) -> Result<BTreeSet<OwnerId>, RefcountError> {
        let mut owners = self.read()?;
        if !owners.remove(&owner) {
            debug!(
                target: REFCOUNT_TARGET,
                owner,
                file = %self.path.display(),
                "owner already absent"
            );
            return Ok(owners);
        }
        self.write(&owners)?;
        debug!(
            target: REFCOUNT_TARGET,
            owner,
            holders = owners.len(),
            file = %self.path.display(),
            "owner unregistered"
        );
        Ok(owners)
    }

    fn write(&self, owners: &BTreeSet<OwnerId>) -> Result<(), RefcountError> {
        let write_error = |source: io::Error| RefcountError::Write {
            path: self.path.clone(),
            source,
        };
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(parent).map_err(write_error)?;
        let owners: Vec<OwnerId> = owners.iter().copied().collect();
        serde_json::to_writer(&mut file, &owners).map_err(|source| write_error(source.into()))?;
        file.write_all(b"\n").map_err(write_error)?;
        file.as_file().sync_all().map_err(write_error)?;
        file.persist(&self.path)
            .map_err(|error| write_error(error.error))?;
        Ok(())
    }
}
