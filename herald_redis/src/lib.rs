//! # Herald redis store
//!
//! A [`KeyValueStore`](herald_core::kv::KeyValueStore) on Redis, backing the
//! distributed lock and the retry counters shared by every consumer replica.

#![deny(missing_docs)]

/// The key_value module exports the redis implementation of the KeyValueStore
pub mod key_value;

pub use key_value::RedisKeyValueStore;
