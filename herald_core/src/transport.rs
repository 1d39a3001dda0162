//! Pub/sub transport contract.

use crate::envelope::Envelope;
use async_trait::async_trait;
use futures_core::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

/// Errors returned by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport or subscription has been closed.
    #[error("Transport closed")]
    Closed,
    /// The transport could not be reached.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    /// The transport refused the request.
    #[error("Transport rejected request: {0}")]
    Rejected(String),
}

/// Parameters of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Subject to subscribe to.
    pub subject: String,
    /// Subscribers sharing a queue group receive each message once between them.
    pub queue_group: Option<String>,
    /// Time the transport waits for an ack before redelivering.
    pub ack_wait: Duration,
}

impl SubscribeOptions {
    /// Creates options for an ungrouped subscription.
    pub fn new(subject: impl Into<String>, ack_wait: Duration) -> Self {
        Self {
            subject: subject.into(),
            queue_group: None,
            ack_wait,
        }
    }

    /// Sets the queue group.
    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }
}

/// An at-least-once stream of deliveries.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// An at-least-once pub/sub transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes a payload to a subject.
    async fn publish(&self, subject: &str, payload: &Value) -> Result<(), TransportError>;

    /// Subscribes to a subject. Unacknowledged deliveries are redelivered after
    /// `ack_wait`.
    async fn subscribe(&self, options: SubscribeOptions) -> Result<EnvelopeStream, TransportError>;
}
