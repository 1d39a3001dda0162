use async_trait::async_trait;
use herald_core::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// An in-memory [`KeyValueStore`].
///
/// Expired keys are dropped lazily on access. Expiry follows
/// [`tokio::time::Instant`], so a paused test runtime controls it.
#[derive(Clone, Debug, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryKeyValueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryKeyValueStore");
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .lock()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether the store holds no live key.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Writes `value` under `key` unconditionally, with an optional expiry.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }
}

fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if data.get(key).is_some_and(|entry| !entry.is_live(now)) {
        data.remove(key);
    }
    data.get_mut(key)
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock().await;
        if live(&mut data, key, now).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock().await;
        match live(&mut data, key, now) {
            Some(entry) if entry.value == expected => {
                data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock().await;
        Ok(match live(&mut data, key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            // Whole seconds, like TTL.
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(Duration::from_secs((*at - now).as_secs())),
        })
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock().await;
        match live(&mut data, key, now) {
            Some(entry) => {
                let current = entry.value.parse::<i64>().map_err(|_| {
                    StoreError::Command(format!("value at '{key}' is not an integer"))
                })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                data.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock().await;
        match live(&mut data, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock().await;
        Ok(live(&mut data, key, now).map(|entry| entry.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock().await;
        let existed = live(&mut data, key, now).is_some();
        data.remove(key);
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_is_exclusive_until_expiry() {
        let store = InMemoryKeyValueStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.set_if_absent("lock:a", "p1", ttl).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "p2", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.set_if_absent("lock:a", "p2", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn delete_if_equals_only_removes_matching_values() {
        let store = InMemoryKeyValueStore::new();
        store
            .set_if_absent("lock:a", "p1", Duration::from_secs(30))
            .await
            .unwrap();

        assert!(!store.delete_if_equals("lock:a", "p2").await.unwrap());
        assert!(store.get("lock:a").await.unwrap().is_some());
        assert!(store.delete_if_equals("lock:a", "p1").await.unwrap());
        assert!(store.get("lock:a").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_reports_missing_persistent_and_remaining() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.ttl("nope").await.unwrap(), KeyTtl::Missing);

        store.set("forever", "x", None).await;
        assert_eq!(store.ttl("forever").await.unwrap(), KeyTtl::Persistent);

        store
            .set_if_absent("lock:a", "p1", Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(10_500)).await;
        assert_eq!(
            store.ttl("lock:a").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(19))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn incr_keeps_expiry_and_restarts_after_it() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.incr("retry:a").await.unwrap(), 1);
        assert!(store.expire("retry:a", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.incr("retry:a").await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.incr("retry:a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_rejects_non_integers() {
        let store = InMemoryKeyValueStore::new();
        store.set("k", "abc", None).await;
        assert!(matches!(
            store.incr("k").await,
            Err(StoreError::Command(_))
        ));
    }
}
