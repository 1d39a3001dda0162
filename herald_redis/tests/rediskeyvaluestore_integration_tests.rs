mod common;

use herald_core::prelude::*;
use herald_redis::RedisKeyValueStore;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[serial]
async fn set_if_absent_only_sets_once() {
    let Some(store) = common::get_store().await else {
        return;
    };
    let key = common::unique_key("nx");

    assert!(store.set_if_absent(&key, "a", Duration::from_secs(30)).await.unwrap());
    assert!(!store.set_if_absent(&key, "b", Duration::from_secs(30)).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("a"));

    match store.ttl(&key).await.unwrap() {
        KeyTtl::Expires(remaining) => assert!(remaining <= Duration::from_secs(30)),
        other => panic!("expected an expiring key, got {other:?}"),
    }
    store.del(&key).await.unwrap();
}

#[tokio::test]
#[serial]
async fn delete_if_equals_checks_the_owner() {
    let Some(store) = common::get_store().await else {
        return;
    };
    let key = common::unique_key("cad");
    store.set_if_absent(&key, "owner-a", Duration::from_secs(30)).await.unwrap();

    assert!(!store.delete_if_equals(&key, "owner-b").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("owner-a"));
    assert!(store.delete_if_equals(&key, "owner-a").await.unwrap());
    assert_eq!(store.ttl(&key).await.unwrap(), KeyTtl::Missing);
}

#[tokio::test]
#[serial]
async fn counters_increment_and_expire() {
    let Some(store) = common::get_store().await else {
        return;
    };
    let key = common::unique_key("incr");

    assert_eq!(store.incr(&key).await.unwrap(), 1);
    assert_eq!(store.incr(&key).await.unwrap(), 2);
    assert_eq!(store.ttl(&key).await.unwrap(), KeyTtl::Persistent);
    assert!(store.expire(&key, Duration::from_secs(60)).await.unwrap());
    assert!(matches!(store.ttl(&key).await.unwrap(), KeyTtl::Expires(_)));

    assert!(store.del(&key).await.unwrap());
    assert!(!store.del(&key).await.unwrap());
    assert!(!store.expire(&key, Duration::from_secs(60)).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
#[serial]
async fn command_errors_are_reported_as_such() {
    let Some(store) = common::get_store().await else {
        return;
    };
    let key = common::unique_key("wrongtype");
    store.set_if_absent(&key, "not-a-number", Duration::from_secs(30)).await.unwrap();

    let err = store.incr(&key).await.unwrap_err();
    assert!(matches!(err, StoreError::Command(_)), "{err:?}");
    store.del(&key).await.unwrap();
}

#[tokio::test]
#[serial]
async fn only_one_replica_holds_the_lock() {
    let Some(store) = common::get_store().await else {
        return;
    };
    let lock = DistributedLock::new(Arc::new(store));
    let key = common::unique_key("lock");

    let attempts = (0..10).map(|i| {
        let lock = lock.clone();
        let key = key.clone();
        tokio::spawn(async move {
            lock.acquire(&key, &format!("worker-{i}"), Duration::from_secs(30))
                .await
                .unwrap()
        })
    });
    let mut acquired = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 1);
    assert!(!lock.release(&key, "someone-else").await.unwrap());
}

#[tokio::test]
#[serial]
async fn retry_counters_survive_across_store_handles() {
    let Some(store) = common::get_store().await else {
        return;
    };
    let subject = common::unique_key("OrderCreated");
    let first = RetryCounter::new(Arc::new(store.clone()));
    let second = RetryCounter::new(Arc::new(store));

    assert_eq!(first.increment(&subject, "abc123").await.unwrap(), 1);
    assert_eq!(second.increment(&subject, "abc123").await.unwrap(), 2);
    assert_eq!(first.get(&subject, "abc123").await.unwrap(), 2);

    second.reset(&subject, "abc123").await.unwrap();
    assert_eq!(first.get(&subject, "abc123").await.unwrap(), 0);
}

#[tokio::test]
async fn unreachable_servers_are_connection_errors() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = RedisKeyValueStore::from_url("redis://127.0.0.1:1/0").unwrap();
    let err = store.get("herald-test:unreachable").await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}
