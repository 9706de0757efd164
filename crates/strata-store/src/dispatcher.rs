//! Connection dispatcher: routes operations to the correct shard.
//!
//! The dispatcher owns the process-wide set of shard connections and a
//! routing *strategy* fixed at construction. The repository is oblivious to
//! which strategy is in use; the API surface hands it a [`Shard`] and the
//! repository runs SQL against it. The active shard is always passed as an
//! explicit parameter -- there is no ambient "current shard" state to leak
//! into background tasks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use strata_core::config::{Backing, JournalMode, DEFAULT_SHARD};
use strata_core::NormalizedKey;
use strata_router::MaglevTable;
use tracing::{debug, info};

use crate::StoreError;

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

/// A named handle to one logical cache database.
///
/// The connection is shared by the foreground API and background eviction
/// tasks; the mutex serializes access within this process, while the
/// driver's busy timeout covers contention from other processes.
pub struct Shard {
    name: String,
    conn: Mutex<Connection>,
}

impl Shard {
    pub(crate) fn open(
        name: &str,
        path: Option<&Path>,
        busy_timeout: Duration,
        journal_mode: JournalMode,
    ) -> Result<Self, StoreError> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };

        // WAL keeps readers unblocked during writes; in-memory databases
        // report their own journal mode and are unaffected. The pragma
        // always returns the resulting mode as a row.
        let pragma = match journal_mode {
            JournalMode::Wal => "PRAGMA journal_mode = WAL",
            JournalMode::Delete => "PRAGMA journal_mode = DELETE",
        };
        let _mode: String = conn.query_row(pragma, [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.busy_timeout(busy_timeout)?;

        debug!(shard = name, path = ?path, "shard connection opened");
        Ok(Self {
            name: name.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// The shard's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` with exclusive access to the shard's connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard").field("name", &self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Routing strategy, fixed at construction.
#[derive(Debug)]
enum Strategy {
    /// One anonymous default connection; every key maps to it.
    Unmanaged,
    /// One named shard; all routing collapses to that name.
    Single(String),
    /// Maglev-routed shards.
    Sharded(MaglevTable),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns the shard connections and the routing strategy.
pub struct Dispatcher {
    shards: BTreeMap<String, Arc<Shard>>,
    strategy: Strategy,
}

impl Dispatcher {
    /// Opens connections for the given backing declaration and fixes the
    /// routing strategy.
    ///
    /// # Errors
    ///
    /// Fails when a database cannot be opened or the router cannot be built.
    pub fn open(
        backing: &Backing,
        busy_timeout: Duration,
        journal_mode: JournalMode,
    ) -> Result<Self, StoreError> {
        let (shards, strategy) = match backing {
            Backing::Unmanaged => {
                let shard = Shard::open(DEFAULT_SHARD, None, busy_timeout, journal_mode)?;
                (
                    BTreeMap::from([(shard.name.clone(), Arc::new(shard))]),
                    Strategy::Unmanaged,
                )
            }
            Backing::Single(path) => {
                let shard = Shard::open(DEFAULT_SHARD, Some(path), busy_timeout, journal_mode)?;
                (
                    BTreeMap::from([(shard.name.clone(), Arc::new(shard))]),
                    Strategy::Single(DEFAULT_SHARD.to_string()),
                )
            }
            Backing::Sharded(map) => {
                let mut shards = BTreeMap::new();
                for (name, path) in map {
                    let shard = Shard::open(name, Some(path), busy_timeout, journal_mode)?;
                    shards.insert(name.clone(), Arc::new(shard));
                }
                let names: Vec<&String> = map.keys().collect();
                (shards, Strategy::Sharded(MaglevTable::build(&names)?))
            }
        };

        info!(shards = shards.len(), "dispatcher ready");
        Ok(Self { shards, strategy })
    }

    /// Number of shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Returns `true` if no shards are configured. Construction guarantees
    /// at least one, so this is only meaningful to callers holding a
    /// dispatcher built elsewhere.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard names, sorted.
    #[must_use]
    pub fn shard_names(&self) -> Vec<&str> {
        self.shards.keys().map(String::as_str).collect()
    }

    /// The shard responsible for `key` under the current strategy.
    #[must_use]
    pub fn shard_for(&self, key: &NormalizedKey) -> &Arc<Shard> {
        let name = match &self.strategy {
            Strategy::Unmanaged => DEFAULT_SHARD,
            Strategy::Single(name) => name,
            Strategy::Sharded(router) => router.lookup(key.bytes()),
        };
        // The strategy only yields names the catalog was built from.
        &self.shards[name]
    }

    /// Groups keys by their assigned shard.
    #[must_use]
    pub fn assign<'k>(
        &self,
        keys: &'k [NormalizedKey],
    ) -> Vec<(Arc<Shard>, Vec<&'k NormalizedKey>)> {
        let mut grouped: BTreeMap<&str, Vec<&'k NormalizedKey>> = BTreeMap::new();
        for key in keys {
            grouped
                .entry(self.shard_for(key).name())
                .or_default()
                .push(key);
        }
        grouped
            .into_iter()
            .map(|(name, keys)| (Arc::clone(&self.shards[name]), keys))
            .collect()
    }

    /// Runs `f` once per shard, collecting the results.
    pub fn with_each<T>(
        &self,
        mut f: impl FnMut(&Arc<Shard>) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        self.shards.values().map(&mut f).collect()
    }

    /// Runs `f` against the named shard.
    pub fn with<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Arc<Shard>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        match self.shards.get(name) {
            Some(shard) => f(shard),
            None => Err(StoreError::UnknownShard(name.to_string())),
        }
    }

    /// Runs `f` against the shard responsible for `key`.
    pub fn with_connection_for<T>(
        &self,
        key: &NormalizedKey,
        f: impl FnOnce(&Arc<Shard>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        f(self.shard_for(key))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("shards", &self.shard_names())
            .field("strategy", &self.strategy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
