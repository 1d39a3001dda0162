use herald_redis::RedisKeyValueStore;

/// Connects to `REDIS_URL`, or returns `None` when it is not set.
pub async fn get_store() -> Option<RedisKeyValueStore> {
    let _ = env_logger::builder().is_test(true).try_init();
    let Ok(redis_url) = std::env::var("REDIS_URL") else {
        log::warn!("REDIS_URL is not set, skipping redis test");
        return None;
    };
    Some(RedisKeyValueStore::from_url(&redis_url).expect("Failed to create Redis pool"))
}

/// A key no other test run uses.
pub fn unique_key(prefix: &str) -> String {
    format!("herald-test:{prefix}:{}", uuid::Uuid::new_v4())
}
