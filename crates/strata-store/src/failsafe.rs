//! Failsafe envelope around storage operations.
//!
//! A cache read or write must never be the reason a request fails: the
//! storage layer is permitted to be temporarily unavailable. Every storage
//! call on the API surface runs inside [`Failsafe::run`], which swallows
//! *transient* driver errors (lock waits, deadlocks, interrupted or
//! cancelled statements, connections that cannot be established) into a
//! caller-supplied default. Anything else -- schema mismatches, constraint
//! violations, programmer errors -- propagates unchanged.

use std::fmt;
use std::sync::Arc;

use rusqlite::ErrorCode;
use tracing::warn;

use crate::StoreError;

// ---------------------------------------------------------------------------
// FailsafeTag
// ---------------------------------------------------------------------------

/// Identifies which operation an error was swallowed on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailsafeTag {
    ReadEntry,
    ReadEntries,
    WriteEntry,
    WriteEntries,
    DeleteEntry,
    DeleteEntries,
    Increment,
    Decrement,
    Clear,
    /// A background task (eviction batch) failed or panicked.
    Async,
}

impl fmt::Display for FailsafeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ReadEntry => "read_entry",
            Self::ReadEntries => "read_entries",
            Self::WriteEntry => "write_entry",
            Self::WriteEntries => "write_entries",
            Self::DeleteEntry => "delete_entry",
            Self::DeleteEntries => "delete_entries",
            Self::Increment => "increment",
            Self::Decrement => "decrement",
            Self::Clear => "clear",
            Self::Async => "async",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

/// Host callback invoked with `(tag, error, returning)` every time the
/// envelope swallows a transient error. `returning` is the default value
/// about to be handed to the caller.
pub type ErrorHandler = Arc<dyn Fn(FailsafeTag, &StoreError, &dyn fmt::Debug) + Send + Sync>;

// ---------------------------------------------------------------------------
// Failsafe
// ---------------------------------------------------------------------------

/// The envelope. Cheap to clone; shared by the API surface and the
/// background executor.
#[derive(Clone, Default)]
pub struct Failsafe {
    error_handler: Option<ErrorHandler>,
}

impl Failsafe {
    /// Creates an envelope with an optional host error handler.
    #[must_use]
    pub fn new(error_handler: Option<ErrorHandler>) -> Self {
        Self { error_handler }
    }

    /// Runs `f`, converting a transient storage error into `default`.
    ///
    /// # Errors
    ///
    /// Non-transient errors propagate unchanged.
    pub fn run<T, F>(&self, tag: FailsafeTag, default: T, f: F) -> Result<T, StoreError>
    where
        T: fmt::Debug,
        F: FnOnce() -> Result<T, StoreError>,
    {
        match f() {
            Ok(value) => Ok(value),
            Err(err) if is_transient(&err) => {
                warn!(tag = %tag, error = %err, "transient storage error swallowed");
                if let Some(ref handler) = self.error_handler {
                    handler(tag, &err, &default);
                }
                Ok(default)
            }
            Err(err) => Err(err),
        }
    }

    /// Reports an error from a background task to the host handler.
    pub fn report_async(&self, err: &StoreError) {
        warn!(tag = %FailsafeTag::Async, error = %err, "background task failed");
        if let Some(ref handler) = self.error_handler {
            handler(FailsafeTag::Async, err, &());
        }
    }
}

impl fmt::Debug for Failsafe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failsafe")
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Classifies an error as transient.
///
/// The list is fixed and exhaustive relative to the driver's taxonomy:
/// lock waits and deadlocks (`SQLITE_BUSY`, `SQLITE_LOCKED`), cancelled or
/// interrupted statements (`SQLITE_INTERRUPT`), connections that cannot be
/// established (`SQLITE_CANTOPEN`), file-locking protocol failures
/// (`SQLITE_PROTOCOL`), and the collaborator-declared [`StoreError::Transient`]
/// wrapper. Unknown errors propagate.
#[must_use]
pub fn is_transient(err: &StoreError) -> bool {
    match err {
        StoreError::Transient(_) => true,
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::OperationInterrupted
                | ErrorCode::CannotOpen
                | ErrorCode::FileLockingProtocolFailed
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
