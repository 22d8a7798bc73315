//! Persisted actor stats store.
//!
//! The store is a small JSON file mapping each actor to its first-seen
//! birthday, lifetime cumulative writes, and display name. It is loaded
//! once at startup (a missing file is an empty store, not an error) and
//! written once at shutdown. Sample counters reset at boot, so the
//! shutdown flush merges the loaded totals with this run's counters.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::actor::{ActorId, ActorLedger};

/// Errors surfaced by the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Reading or writing the store file failed.
    #[error("failed to access actor store '{path}': {source}")]
    Io {
        /// The store path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The store contents did not parse.
    #[error("failed to parse actor store '{path}': {source}")]
    Parse {
        /// The store path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// One actor's persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredActor {
    /// Unix seconds when the actor was first observed.
    pub birthday: u64,
    /// Lifetime cumulative KiB written.
    pub cumulative_kib: f64,
    /// Human-readable name, if one was ever learned.
    #[serde(default)]
    pub name: Option<String>,
}

/// The keyed record store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorStore {
    entries: BTreeMap<ActorId, StoredActor>,
}

impl ActorStore {
    /// Loads the store from a JSON file. A missing file yields an empty
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no previous actor store, starting empty");
                return Ok(Self::default());
            },
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                });
            },
        };
        let store: Self = serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), actors = store.entries.len(), "loaded actor store");
        Ok(store)
    }

    /// Writes the store to a JSON file, replacing it atomically via a
    /// sibling temp file and rename.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };
        let content = serde_json::to_string(self).map_err(|source| StoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        info!(path = %path.display(), actors = self.entries.len(), "actor store flushed");
        Ok(())
    }

    /// Builds the shutdown snapshot from a ledger: each actor's persisted
    /// total is its loaded carryover plus this run's counter, and loaded
    /// birthdays and names are preserved.
    #[must_use]
    pub fn from_ledger(ledger: &ActorLedger) -> Self {
        let entries = ledger
            .records()
            .map(|(id, record)| {
                (
                    id,
                    StoredActor {
                        birthday: record.birthday,
                        cumulative_kib: record.lifetime_kib(),
                        name: record.name.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// The persisted records, keyed by actor.
    #[must_use]
    pub const fn entries(&self) -> &BTreeMap<ActorId, StoredActor> {
        &self.entries
    }

    /// Inserts or replaces one record.
    pub fn insert(&mut self, id: ActorId, record: StoredActor) {
        self.entries.insert(id, record);
    }
}
