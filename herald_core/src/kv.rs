//! Key-value store contract used for locks and retry counters.

use async_trait::async_trait;
use std::time::Duration;

/// Errors returned by a [`KeyValueStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped.
    #[error("Key-value store connection error: {0}")]
    Connection(String),
    /// The command did not complete in time.
    #[error("Key-value store timeout: {0}")]
    Timeout(String),
    /// A unique key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    /// The store rejected the command (wrong type, script error, ...).
    #[error("Key-value store command error: {0}")]
    Command(String),
}

impl StoreError {
    /// Returns `true` when retrying the same command may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Timeout(_))
    }
}

/// Remaining lifetime of a key, as reported by `TTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (`-2`).
    Missing,
    /// The key exists without an expiry (`-1`).
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Interprets a raw `TTL` reply in seconds.
    pub fn from_reply(seconds: i64) -> Self {
        match seconds {
            -1 => KeyTtl::Persistent,
            s if s < 0 => KeyTtl::Missing,
            s => KeyTtl::Expires(Duration::from_secs(s as u64)),
        }
    }

    /// The raw `TTL` reply this value corresponds to.
    pub fn as_reply(&self) -> i64 {
        match self {
            KeyTtl::Missing => -2,
            KeyTtl::Persistent => -1,
            KeyTtl::Expires(d) => d.as_secs() as i64,
        }
    }
}

/// The subset of a Redis-like store herald relies on.
///
/// Every mutation is either atomic and conditional (`set_if_absent`,
/// `delete_if_equals`) or an idempotent increment with a self-expiring TTL;
/// no transactions are assumed.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `SET key value NX EX ttl`. Returns `false` if the key already exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Atomically deletes `key` only if its value equals `expected`.
    ///
    /// Returns `true` if the key was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// `TTL key`.
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// `INCR key`. Returns the value after the increment.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// `EXPIRE key seconds`. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `DEL key`. Returns `true` if a key was removed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;
}
