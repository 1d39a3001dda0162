//! # Herald core
//!
//! Backend-agnostic building blocks for reliable event processing on top of an
//! at-least-once pub/sub transport:
//!
//! - [`lock::DistributedLock`] serializes processing of the same logical event
//!   across consumer replicas.
//! - [`retry_counter::RetryCounter`] tracks failed attempts per event.
//! - [`classifier`] decides whether a failure is worth retrying.
//! - [`listener::ListenerCore`] wraps a handler with locking, retry bookkeeping
//!   and the dead-letter hand-off.
//! - [`reconciler::DeadLetterReconciler`] drains the dead-letter store back into
//!   the transport.
//!
//! The collaborators (transport, key-value store, dead-letter store) are traits;
//! `herald_mem`, `herald_pg` and `herald_redis` provide implementations.

#![deny(missing_docs)]

pub mod backoff;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod identity;
pub mod kv;
pub mod listener;
pub mod lock;
pub mod reconciler;
pub mod retry_counter;
pub mod telemetry;
pub mod transport;

pub mod prelude {
    //! The prelude module for the `herald_core` crate.
    pub use crate::classifier::{ErrorDescriptor, FailureClass, classify, is_duplicate_key};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::{
        ConfigError, ListenerConfig, ProcessId, ReconcilerConfig, RetryCounterConfig,
    };
    pub use crate::dead_letter::{
        DeadLetterRecord, DeadLetterStatus, DeadLetterStore, DeadLetterStoreError, NewDeadLetter,
    };
    pub use crate::envelope::{Delivery, Envelope};
    pub use crate::error::ProcessingError;
    pub use crate::handler::EventHandler;
    pub use crate::identity::{
        ContentDigestIdentity, DefaultIdentity, EventIdentity, ListEntityIdentity,
    };
    pub use crate::kv::{KeyTtl, KeyValueStore, StoreError};
    pub use crate::listener::{ListenerCore, Outcome, Subscription, SubscriptionError};
    pub use crate::lock::DistributedLock;
    pub use crate::reconciler::{DeadLetterReconciler, ReconcileOutcome, ReconcileSummary};
    pub use crate::retry_counter::RetryCounter;
    pub use crate::telemetry::{
        ListenerMetrics, LogTracer, NoopMetrics, NoopTracer, Span, SpanGuard, Tracer,
    };
    pub use crate::transport::{EnvelopeStream, SubscribeOptions, Transport, TransportError};
}
