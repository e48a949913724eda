//! The coordination-store contract consumed by the scheduler.
//!
//! A store is a versioned key-value space plus leased locks and change
//! notification. Anything that can offer these primitives (ZooKeeper, etcd,
//! a SQL table with row versions, ...) can back the engine; the engine never
//! assumes how a given implementation achieves them.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::DbError;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A stored value together with its version.
///
/// Versions start at 1 when a key is created and grow by one on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// Precondition attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Unconditional write.
    Any,
    /// Create only; fails with [`DbError::AlreadyExists`] if the key is present.
    Absent,
    /// Compare-and-set against the given version.
    Version(u64),
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Proof of holding a leased lock.
///
/// `token` grows monotonically across every acquisition of every lock, so a
/// scheduler that was demoted and later re-acquires gets a fresh token and its
/// old one is rejected by fenced writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub lock: String,
    pub owner: String,
    pub token: u64,
    pub expires_at: Instant,
}

// ---------------------------------------------------------------------------
// Change notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// Emitted after every successful write or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    pub kind: ChangeKind,
}

// ---------------------------------------------------------------------------
// CoordinationStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, DbError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, DbError>;

    /// Write `value` under `key` if `expect` holds.
    ///
    /// When `fence` is given the write is only applied while that fence
    /// still owns its lock; otherwise it fails with [`DbError::LockLost`].
    /// Returns the new version.
    async fn put(
        &self,
        key: &str,
        value: String,
        expect: Expect,
        fence: Option<&Fence>,
    ) -> Result<u64, DbError>;

    /// Remove a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str, fence: Option<&Fence>) -> Result<(), DbError>;

    /// Try to take the named lock for `owner` for `ttl`.
    ///
    /// Returns `None` while another owner holds an unexpired lease. An
    /// expired lease is reclaimed.
    async fn acquire_lock(
        &self,
        lock: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Fence>, DbError>;

    /// Extend a held lease. Fails with [`DbError::LockLost`] if the lease
    /// expired or was taken over.
    async fn renew_lock(&self, fence: &Fence, ttl: Duration) -> Result<Fence, DbError>;

    /// Give up a lease. Releasing a lease that is no longer held is a no-op.
    async fn release_lock(&self, fence: &Fence) -> Result<(), DbError>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<ChangeEvent>;
}
