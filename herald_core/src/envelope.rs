//! Inbound messages as delivered by a [`Transport`](crate::transport::Transport).

use crate::transport::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Transport-assigned handle used to acknowledge a delivery.
///
/// Not acknowledging a delivery before the subscription's ack timeout makes
/// the transport redeliver it.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Acknowledges the delivery.
    async fn ack(&self) -> Result<(), TransportError>;

    /// How many times this message has been delivered, starting at 1.
    fn delivery_count(&self) -> u32 {
        1
    }
}

/// A message received from a subscription.
#[derive(Clone)]
pub struct Envelope {
    /// Topic the message was published to.
    pub subject: String,
    /// The message payload, verbatim.
    pub payload: Value,
    delivery: Arc<dyn Delivery>,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(subject: impl Into<String>, payload: Value, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            delivery,
        }
    }

    /// Acknowledges the message.
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.delivery.ack().await
    }

    /// How many times this message has been delivered.
    pub fn delivery_count(&self) -> u32 {
        self.delivery.delivery_count()
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("subject", &self.subject)
            .field("payload", &self.payload)
            .field("delivery_count", &self.delivery_count())
            .finish()
    }
}
