//! In-process [`CoordinationStore`].
//!
//! Backs the test suites and the CLI. Lease expiry uses the tokio clock, so
//! tests can drive it with a paused runtime.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::store::{ChangeEvent, ChangeKind, CoordinationStore, Expect, Fence, Versioned};
use crate::DbError;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Lease {
    owner: String,
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Versioned>,
    leases: HashMap<String, Lease>,
    last_token: u64,
}

impl Inner {
    fn check_fence(&self, fence: Option<&Fence>) -> Result<(), DbError> {
        let Some(fence) = fence else {
            return Ok(());
        };

        match self.leases.get(&fence.lock) {
            Some(lease) if lease.token == fence.token && lease.expires_at > Instant::now() => Ok(()),
            _ => Err(DbError::LockLost {
                lock: fence.lock.clone(),
                token: fence.token,
            }),
        }
    }
}

/// A versioned map guarded by a single async mutex.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn notify(&self, key: &str, kind: ChangeKind) {
        // No subscribers is fine.
        let _ = self.events.send(ChangeEvent {
            key: key.to_owned(),
            kind,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, DbError> {
        Ok(self.inner.lock().await.entries.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, DbError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        expect: Expect,
        fence: Option<&Fence>,
    ) -> Result<u64, DbError> {
        let version = {
            let mut inner = self.inner.lock().await;
            inner.check_fence(fence)?;

            let current = inner.entries.get(key).map(|v| v.version);
            match (expect, current) {
                (Expect::Any, _) | (Expect::Absent, None) => {}
                (Expect::Absent, Some(_)) => return Err(DbError::AlreadyExists(key.to_owned())),
                (Expect::Version(v), Some(c)) if v == c => {}
                (Expect::Version(v), actual) => {
                    return Err(DbError::VersionConflict {
                        key: key.to_owned(),
                        expected: Some(v),
                        actual,
                    })
                }
            }

            let version = current.unwrap_or(0) + 1;
            inner
                .entries
                .insert(key.to_owned(), Versioned { value, version });
            version
        };

        debug!(key, version, "store put");
        self.notify(key, ChangeKind::Put);
        Ok(version)
    }

    async fn delete(&self, key: &str, fence: Option<&Fence>) -> Result<(), DbError> {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.check_fence(fence)?;
            inner.entries.remove(key).is_some()
        };

        if removed {
            self.notify(key, ChangeKind::Delete);
        }
        Ok(())
    }

    async fn acquire_lock(
        &self,
        lock: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Fence>, DbError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        if let Some(lease) = inner.leases.get(lock) {
            if lease.expires_at > now {
                return Ok(None);
            }
            debug!(lock, previous_owner = %lease.owner, "reclaiming expired lease");
        }

        inner.last_token += 1;
        let token = inner.last_token;
        let expires_at = now + ttl;
        inner.leases.insert(
            lock.to_owned(),
            Lease {
                owner: owner.to_owned(),
                token,
                expires_at,
            },
        );

        Ok(Some(Fence {
            lock: lock.to_owned(),
            owner: owner.to_owned(),
            token,
            expires_at,
        }))
    }

    async fn renew_lock(&self, fence: &Fence, ttl: Duration) -> Result<Fence, DbError> {
        let mut inner = self.inner.lock().await;
        inner.check_fence(Some(fence))?;

        let expires_at = Instant::now() + ttl;
        if let Some(lease) = inner.leases.get_mut(&fence.lock) {
            lease.expires_at = expires_at;
        }

        Ok(Fence {
            expires_at,
            ..fence.clone()
        })
    }

    async fn release_lock(&self, fence: &Fence) -> Result<(), DbError> {
        let mut inner = self.inner.lock().await;
        if inner
            .leases
            .get(&fence.lock)
            .is_some_and(|lease| lease.token == fence.token)
        {
            inner.leases.remove(&fence.lock);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}
