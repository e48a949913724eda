//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("key not found: '{0}'")]
    NotFound(String),

    #[error("key already exists: '{0}'")]
    AlreadyExists(String),

    /// A compare-and-set write saw a different version than the caller expected.
    #[error("version conflict on '{key}': expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// The fencing token presented with a write no longer owns its lock.
    #[error("lock '{lock}' is no longer held by token {token}")]
    LockLost { lock: String, token: u64 },

    /// Failure reported by an external store implementation.
    #[error("store backend error: {0}")]
    Backend(String),
}
