//! The user-supplied processing callback.

use crate::envelope::Envelope;
use crate::error::ProcessingError;
use async_trait::async_trait;

/// Processes the events of one subject.
///
/// Handlers must be idempotent: the lock narrows concurrent execution for the
/// same event, but a crash after the side effect and before the ack still
/// leads to a redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Subject this handler subscribes to.
    fn subject(&self) -> &str;

    /// Processes one event.
    async fn handle(&self, envelope: &Envelope) -> Result<(), ProcessingError>;

    /// A stable identity for the event, overriding the listener's default
    /// [`EventIdentity`](crate::identity::EventIdentity).
    fn event_id(&self, _envelope: &Envelope) -> Option<String> {
        None
    }
}
