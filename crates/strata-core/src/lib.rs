//! Strata Core -- shared types for the SQL-backed cache engine.
//!
//! This crate defines the pieces every other Strata crate builds on: the key
//! normalization pipeline (truncation + signed 64-bit hashing), the in-transit
//! cache entry wrapper, and the store configuration with its defaults.

pub mod config;
pub mod entry;
pub mod key;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Top-level error type for the strata-core crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration error (conflicting or invalid options).
    #[error("configuration error: {0}")]
    Config(String),

    /// An entry could not be decoded from its stored bytes.
    #[error("entry decode error: {0}")]
    EntryDecode(String),

    /// Tracing/logging initialization failed.
    #[error("tracing initialization error: {0}")]
    TracingInit(String),
}

/// Convenience alias for `Result<T, CoreError>`.
pub type CoreResult<T> = Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Tracing / Logging
// ---------------------------------------------------------------------------

/// Initialize structured tracing with the given verbosity level.
///
/// # Behaviour
///
/// | `verbose` | `quiet` | `json_output` | Effect                            |
/// |-----------|---------|---------------|-----------------------------------|
/// | `true`    | _       | _             | TRACE level (most verbose)        |
/// | _         | `true`  | _             | ERROR level only                  |
/// | `false`   | `false` | _             | INFO level (default)              |
/// | _         | _       | `true`        | JSON-formatted log lines          |
/// | _         | _       | `false`       | Human-readable, compact log lines |
///
/// The `RUST_LOG` environment variable, when set, takes precedence over the
/// programmatic level selection so that operators can fine-tune per-module
/// verbosity without recompiling.
///
/// # Errors
///
/// Returns [`CoreError::TracingInit`] if the global subscriber has already
/// been set (i.e. this function was called more than once in the same
/// process).
pub fn init_tracing(verbose: bool, quiet: bool, json_output: bool) -> Result<(), CoreError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if verbose {
        "trace"
    } else if quiet {
        "error"
    } else {
        "info"
    };

    // Allow RUST_LOG to override the programmatic default.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json_output {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|e| CoreError::TracingInit(e.to_string()))
    } else {
        fmt()
            .compact()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|e| CoreError::TracingInit(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use config::{
    load_config_file, Backing, ClearWith, ExpiryMethod, JournalMode, StrataConfig,
};
pub use entry::CacheEntry;
pub use key::{key_hash, NormalizedKey};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_init_error_display() {
        let err = CoreError::TracingInit("already initialized".to_string());
        assert!(err.to_string().contains("tracing initialization error"));
        assert!(err.to_string().contains("already initialized"));
    }

    // NOTE: `init_tracing` sets a global subscriber, so it can only succeed
    // once per process.  We verify the *second* call returns an appropriate
    // error.
    #[test]
    fn init_tracing_returns_error_on_double_init() {
        let _ = init_tracing(false, false, false);

        let result = init_tracing(false, false, false);
        assert!(result.is_err());
        if let Err(CoreError::TracingInit(msg)) = result {
            assert!(!msg.is_empty());
        } else {
            panic!("expected CoreError::TracingInit");
        }
    }
}
