//! # Herald memory backends
//!
//! In-memory implementations of herald's collaborators, primarily for testing:
//!
//! - [`InMemoryKeyValueStore`] for locks and retry counters, expiring keys on
//!   tokio's clock so that `start_paused` tests can fast-forward TTLs.
//! - [`InMemoryDeadLetterStore`] with atomic claims.
//! - [`InMemoryTransport`], an at-least-once bus with queue groups and ack
//!   timeouts.
//! - [`ManualClock`] and [`InMemoryMetrics`] for asserting on schedules and
//!   outcomes.
//!
//! None of them persists anything; they are not meant for production use.

#![deny(missing_docs)]

mod clock;
mod dead_letter;
mod kv;
mod metrics;
mod transport;

pub use clock::*;
pub use dead_letter::*;
pub use kv::*;
pub use metrics::*;
pub use transport::*;
