//! Distributed mutual exclusion on top of a [`KeyValueStore`].
//!
//! A lock is a key written with `SET NX EX` whose value is the owner token.
//! Only the owner that wrote that exact value may delete it; a lock whose
//! owner crashed simply expires. There is no queueing or fairness: callers
//! that fail to acquire decide for themselves whether to wait, skip or let the
//! transport redeliver.

use crate::kv::{KeyTtl, KeyValueStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Key of the processing lock for an event.
pub fn lock_key(subject: &str, event_id: &str) -> String {
    format!("lock:{subject}:{event_id}")
}

/// A distributed lock backed by a shared key-value store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
}

impl DistributedLock {
    /// Creates a lock over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Tries to take `key` for `owner` for `ttl`. Returns `false` if it is held.
    pub async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        // Sub-second TTLs would round down to "no expiry" on EX-based stores.
        let ttl = ttl.max(Duration::from_secs(1));
        let acquired = self.store.set_if_absent(key, owner, ttl).await?;
        if acquired {
            log::debug!("Acquired lock '{}' as '{}' for {:?}", key, owner, ttl);
        } else {
            log::debug!("Lock '{}' is held by another owner", key);
        }
        Ok(acquired)
    }

    /// Releases `key` if it is still held by `owner`.
    ///
    /// Returns `false` when the lock expired or was re-acquired by someone
    /// else in the meantime; in that case nothing is deleted.
    pub async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let released = self.store.delete_if_equals(key, owner).await?;
        if released {
            log::debug!("Released lock '{}' held by '{}'", key, owner);
        } else {
            log::warn!(
                "Lock '{}' was no longer held by '{}' at release, it expired or changed owner",
                key,
                owner
            );
        }
        Ok(released)
    }

    /// Remaining lifetime of `key`.
    pub async fn remaining_ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        self.store.ttl(key).await
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock").finish()
    }
}
