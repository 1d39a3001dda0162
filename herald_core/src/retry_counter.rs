//! Per-event retry bookkeeping.

use crate::backoff::retry_counter_ttl;
use crate::config::RetryCounterConfig;
use crate::kv::{KeyValueStore, StoreError};
use std::sync::Arc;

/// Key of the retry counter for an event.
pub fn counter_key(event_type: &str, event_id: &str) -> String {
    format!("retry:{event_type}:{event_id}")
}

/// Counts failed attempts per `(event_type, event_id)`.
///
/// A counter is created on the first failure, incremented on every further
/// one, deleted on success and otherwise left to expire. Its expiry grows
/// exponentially with the attempt count.
#[derive(Clone)]
pub struct RetryCounter {
    store: Arc<dyn KeyValueStore>,
    config: RetryCounterConfig,
}

impl RetryCounter {
    /// Creates a counter with default expiry settings.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(store, RetryCounterConfig::default())
    }

    /// Creates a counter with custom expiry settings.
    pub fn with_config(store: Arc<dyn KeyValueStore>, config: RetryCounterConfig) -> Self {
        Self { store, config }
    }

    /// Failed attempts recorded so far, `0` if none.
    pub async fn get(&self, event_type: &str, event_id: &str) -> Result<u32, StoreError> {
        let key = counter_key(event_type, event_id);
        match self.store.get(&key).await? {
            Some(value) => value.parse::<u32>().map_err(|e| {
                StoreError::Command(format!("retry counter '{key}' holds '{value}': {e}"))
            }),
            None => Ok(0),
        }
    }

    /// Records one more failed attempt and returns the new count.
    pub async fn increment(&self, event_type: &str, event_id: &str) -> Result<u32, StoreError> {
        let key = counter_key(event_type, event_id);
        let count = self.store.incr(&key).await?.max(0) as u32;
        let ttl = retry_counter_ttl(self.config.base_ttl, self.config.max_ttl, count);
        self.store.expire(&key, ttl).await?;
        log::debug!(
            "Retry counter '{}' is now {} (expires in {:?})",
            key,
            count,
            ttl
        );
        Ok(count)
    }

    /// Forgets all recorded attempts.
    pub async fn reset(&self, event_type: &str, event_id: &str) -> Result<(), StoreError> {
        self.store.del(&counter_key(event_type, event_id)).await?;
        Ok(())
    }

    /// Whether the recorded attempts still leave room for another delivery.
    pub async fn should_retry(
        &self,
        event_type: &str,
        event_id: &str,
        max_retries: u32,
    ) -> Result<bool, StoreError> {
        Ok(Self::allows_retry(
            self.get(event_type, event_id).await?,
            max_retries,
        ))
    }

    /// `attempts < max_retries`.
    pub fn allows_retry(attempts: u32, max_retries: u32) -> bool {
        attempts < max_retries
    }
}

impl std::fmt::Debug for RetryCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCounter")
            .field("config", &self.config)
            .finish()
    }
}
