//! # Herald
//!
//! Reliable event processing on top of an at-least-once pub/sub transport:
//! per-event distributed locking, bounded retries with exponential backoff
//! and a durable dead-letter store that is reconciled back into the transport.
//!
//! Backends are enabled with features: `in-memory` (default), `postgres` for
//! the dead-letter store and `redis` for locks and retry counters.

#![deny(missing_docs)]

#[cfg(feature = "in-memory")]
/// In-memory backends, for tests and single-process use.
pub mod mem {
    //! Re-exports the `herald_mem` crate.
    pub use herald_mem::*;
}

#[cfg(feature = "postgres")]
/// The postgres dead-letter store.
pub mod pg {
    //! Re-exports the `herald_pg` crate.
    pub use herald_pg::*;
}

#[cfg(feature = "redis")]
/// The redis key-value store.
pub mod redis {
    //! Re-exports the `herald_redis` crate.
    pub use herald_redis::*;
}

pub mod prelude {
    //! The prelude module for the `herald` crate.
    pub use herald_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
    #[cfg(feature = "postgres")]
    pub use super::pg::{Migrator, PgDeadLetterStore};
    #[cfg(feature = "redis")]
    pub use super::redis::RedisKeyValueStore;
}
