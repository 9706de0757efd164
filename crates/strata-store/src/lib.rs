//! Strata Store -- the durable SQL-backed cache engine.
//!
//! A key/value cache whose backing store is an `entries` table in one or
//! more SQLite databases instead of RAM. Callers see a conventional cache
//! surface ([`Store`]: read, write, fetch, delete, increment, clear); the
//! engine maps each call to batched SQL, routes keys to shards by Maglev
//! consistent hashing, bounds the table's age/row-count/byte-size with
//! probabilistic background eviction, and converts transient storage faults
//! into defaulted return values so cache trouble never becomes caller
//! trouble.

pub mod dispatcher;
pub mod estimator;
pub mod executor;
pub mod expiry;
pub mod failsafe;
pub mod repository;
pub mod store;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Top-level error type for the strata-store crate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An error from the SQL driver. The failsafe envelope inspects the
    /// underlying code to decide whether it is transient.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A collaborator-declared transient storage error.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// An I/O error occurred (database directory creation and the like).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A shared-type error bubbled up from strata-core.
    #[error(transparent)]
    Core(#[from] strata_core::CoreError),

    /// A router construction error.
    #[error(transparent)]
    Router(#[from] strata_router::RouterError),

    /// An operation referenced a shard this store does not know.
    #[error("unknown shard: {0}")]
    UnknownShard(String),

    /// The operation is not supported by this store.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
}

/// Convenience alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use dispatcher::{Dispatcher, Shard};
pub use executor::TaskWrapper;
pub use failsafe::{ErrorHandler, Failsafe, FailsafeTag};
pub use store::{EvictionJob, JobQueue, ReadOptions, Store, StoreBuilder, WriteOptions};
