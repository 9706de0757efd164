//! Store configuration.
//!
//! All tunables of the cache engine live here, deserializable from the host
//! application's config file. Runtime-only hooks (error handler, background
//! job queue, task wrapper) are not part of this struct; they are attached
//! when the store is built.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CoreError;

/// Per-row size overhead added to `key.len() + value.len()` when estimating
/// `byte_size`, without value encryption.
pub const ESTIMATED_ROW_OVERHEAD: u64 = 140;

/// Per-row size overhead when value encryption is enabled (ciphertext
/// framing and key references make rows considerably larger).
pub const ESTIMATED_ENCRYPTED_ROW_OVERHEAD: u64 = 310;

/// Shard name used when a single `database` is configured.
pub const DEFAULT_SHARD: &str = "primary";

// ---------------------------------------------------------------------------
// StrataConfig
// ---------------------------------------------------------------------------

/// Top-level store configuration.
///
/// `database`, `databases` and `connects_to` are mutually exclusive ways of
/// declaring the backing database set; [`StrataConfig::validate`] rejects a
/// config that sets more than one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Path of the single backing database.
    pub database: Option<PathBuf>,
    /// Named shard databases; keys become shard names.
    pub databases: BTreeMap<String, PathBuf>,
    /// Explicit shard map, the long form of `databases`.
    pub connects_to: BTreeMap<String, PathBuf>,
    /// Subset of the configured shards this store uses. Empty means all.
    pub shards: Vec<String>,
    /// Maximum normalized key length in bytes.
    pub max_key_bytesize: usize,
    /// How `clear` empties each shard.
    pub clear_with: ClearWith,
    /// Eviction bounds and scheduling tunables.
    pub expiry: ExpiryConfig,
    /// Number of rows sampled by the size estimator.
    pub size_estimate_samples: usize,
    /// Whether values are encrypted by the storage layer. Only the row size
    /// overhead changes here; the engine treats values as opaque either way.
    pub encrypt: bool,
    /// Opaque encryption options handed through to the storage layer.
    pub encryption_context_properties: BTreeMap<String, serde_json::Value>,
    /// Opaque options handed through to the host cache framework.
    pub store_options: BTreeMap<String, serde_json::Value>,
    /// When `false`, background tasks run with logging suppressed.
    pub instrumentation: bool,
    /// Driver lock-wait timeout in milliseconds, passed through to each
    /// connection. Waits beyond this surface as transient busy errors.
    pub busy_timeout_ms: u64,
    /// Journal mode pragma applied to each connection.
    pub journal_mode: JournalMode,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            database: None,
            databases: BTreeMap::new(),
            connects_to: BTreeMap::new(),
            shards: Vec::new(),
            max_key_bytesize: 1024,
            clear_with: ClearWith::Truncate,
            expiry: ExpiryConfig::default(),
            size_estimate_samples: 10_000,
            encrypt: false,
            encryption_context_properties: BTreeMap::new(),
            store_options: BTreeMap::new(),
            instrumentation: true,
            busy_timeout_ms: 5_000,
            journal_mode: JournalMode::Wal,
        }
    }
}

impl StrataConfig {
    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] when more than one backing declaration
    /// is present, when `shards` names an undeclared shard, or when a
    /// tunable is out of range.
    pub fn validate(&self) -> Result<(), CoreError> {
        let declared = [
            self.database.is_some(),
            !self.databases.is_empty(),
            !self.connects_to.is_empty(),
        ]
        .iter()
        .filter(|&&d| d)
        .count();
        if declared > 1 {
            return Err(CoreError::Config(
                "database, databases and connects_to are mutually exclusive".to_string(),
            ));
        }

        if self.max_key_bytesize < 16 {
            return Err(CoreError::Config(format!(
                "max_key_bytesize must be at least 16, got {}",
                self.max_key_bytesize
            )));
        }
        if self.expiry.batch_size == 0 {
            return Err(CoreError::Config("expiry.batch_size must be positive".to_string()));
        }
        if self.size_estimate_samples == 0 {
            return Err(CoreError::Config(
                "size_estimate_samples must be positive".to_string(),
            ));
        }

        let named = self.named_shards();
        for shard in &self.shards {
            if !named.contains_key(shard) {
                return Err(CoreError::Config(format!(
                    "shards lists '{shard}' which is not a configured database"
                )));
            }
        }

        Ok(())
    }

    /// Resolves the backing declaration into its canonical form.
    #[must_use]
    pub fn backing(&self) -> Backing {
        if let Some(ref path) = self.database {
            return Backing::Single(path.clone());
        }
        let named = self.named_shards();
        if named.is_empty() {
            return Backing::Unmanaged;
        }
        let selected: BTreeMap<String, PathBuf> = if self.shards.is_empty() {
            named
        } else {
            named
                .into_iter()
                .filter(|(name, _)| self.shards.contains(name))
                .collect()
        };
        Backing::Sharded(selected)
    }

    /// The per-row size overhead under the current encryption setting.
    #[must_use]
    pub const fn row_overhead(&self) -> u64 {
        if self.encrypt {
            ESTIMATED_ENCRYPTED_ROW_OVERHEAD
        } else {
            ESTIMATED_ROW_OVERHEAD
        }
    }

    fn named_shards(&self) -> BTreeMap<String, PathBuf> {
        if !self.databases.is_empty() {
            self.databases.clone()
        } else {
            self.connects_to.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Loads and validates a configuration from a single YAML file.
///
/// Discovering where the file lives (project directory, environment
/// overrides) is the host integration's concern; this only parses one
/// explicit path.
///
/// # Errors
///
/// Returns [`CoreError::Config`] when the file cannot be read, parsed, or
/// fails [`StrataConfig::validate`].
pub fn load_config_file(path: &Path) -> Result<StrataConfig, CoreError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CoreError::Config(format!(
            "failed to read config file '{}': {e}",
            path.display()
        ))
    })?;

    let config: StrataConfig = serde_yml::from_str(&content).map_err(|e| {
        CoreError::Config(format!(
            "failed to parse config file '{}': {e}",
            path.display()
        ))
    })?;

    config.validate()?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

// ---------------------------------------------------------------------------
// Backing
// ---------------------------------------------------------------------------

/// Canonical form of the backing-database declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// No declaration: one anonymous in-process database.
    Unmanaged,
    /// One named database.
    Single(PathBuf),
    /// Named shards selected by consistent hashing.
    Sharded(BTreeMap<String, PathBuf>),
}

// ---------------------------------------------------------------------------
// JournalMode
// ---------------------------------------------------------------------------

/// Journal mode applied to each shard connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-ahead logging: readers proceed during writes. The default.
    #[default]
    Wal,
    /// Rollback journal: an exclusive writer blocks readers too. For hosts
    /// whose tooling cannot handle WAL side files.
    Delete,
}

// ---------------------------------------------------------------------------
// ClearWith
// ---------------------------------------------------------------------------

/// Strategy used by `clear` to empty a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearWith {
    /// One unqualified delete, letting the backend take its truncate fast
    /// path. The default.
    #[default]
    Truncate,
    /// Chunked deletes in bounded batches; safe inside transactional test
    /// harnesses where a truncate would escape the enclosing transaction.
    Delete,
}

// ---------------------------------------------------------------------------
// ExpiryConfig
// ---------------------------------------------------------------------------

/// Eviction bounds and scheduling tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Maximum entry age in seconds. `None` disables age-based expiry.
    pub max_age: Option<u64>,
    /// Maximum (estimated) row count per shard.
    pub max_entries: Option<u64>,
    /// Maximum (estimated) total byte size per shard.
    pub max_size: Option<u64>,
    /// Candidate rows targeted by one eviction batch.
    pub batch_size: usize,
    /// Where eviction batches run.
    pub method: ExpiryMethod,
    /// Job queue name used when `method` is `job`.
    pub queue: Option<String>,
}

impl ExpiryConfig {
    /// Eviction batches are scheduled at `multiplier` times the write rate,
    /// keeping steady downward pressure on the row count.
    pub const MULTIPLIER: f64 = 2.0;

    /// Default `max_age`: two weeks, in seconds.
    pub const DEFAULT_MAX_AGE: u64 = 60 * 60 * 24 * 14;
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            max_age: Some(Self::DEFAULT_MAX_AGE),
            max_entries: None,
            max_size: None,
            batch_size: 100,
            method: ExpiryMethod::Thread,
            queue: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExpiryMethod
// ---------------------------------------------------------------------------

/// Where eviction batches execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryMethod {
    /// Run on the store's bounded background pool. The default.
    #[default]
    Thread,
    /// Enqueue a durable job on the host application's job runner.
    Job,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
