use async_trait::async_trait;
use herald_core::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug)]
struct Subscriber {
    queue_group: Option<String>,
    ack_wait: Duration,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Debug, Default)]
struct TransportData {
    subscribers: HashMap<String, Vec<Subscriber>>,
    published: HashMap<String, Vec<Value>>,
    next_in_group: HashMap<(String, String), usize>,
}

/// An in-memory at-least-once [`Transport`].
///
/// Each publish is delivered to every ungrouped subscriber of the subject and
/// to one member of each queue group, picked round robin. A delivery that is
/// not acked within the subscriber's `ack_wait` is delivered again to the same
/// subscriber, until it is acked, the subscriber goes away or the optional
/// delivery limit is reached.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTransport {
    data: Arc<Mutex<TransportData>>,
    failing_publishes: Arc<AtomicU32>,
    max_deliveries: Option<u32>,
}

impl InMemoryTransport {
    /// Creates a transport without subscribers.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryTransport");
        Self::default()
    }

    /// Stops redelivering a message after it was delivered `max` times.
    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max.max(1));
        self
    }

    /// Makes the next `count` publishes fail with
    /// [`TransportError::Unavailable`].
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Every payload successfully published to `subject`, in order.
    pub async fn published(&self, subject: &str) -> Vec<Value> {
        self.data
            .lock()
            .await
            .published
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    fn take_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn deliver(&self, subject: &str, payload: &Value, subscriber: &Subscriber) {
        let delivery = Arc::new(InMemoryDelivery {
            acked: Arc::new(AtomicBool::new(false)),
            count: 1,
        });
        let tx = subscriber.tx.clone();
        let envelope = Envelope::new(subject, payload.clone(), delivery.clone());
        if tx.send(envelope).is_err() {
            return;
        }

        let ack_wait = subscriber.ack_wait;
        let max_deliveries = self.max_deliveries;
        let subject = subject.to_string();
        let payload = payload.clone();
        tokio::spawn(async move {
            let acked = delivery.acked.clone();
            let mut count = 1;
            loop {
                tokio::time::sleep(ack_wait).await;
                if acked.load(Ordering::SeqCst) {
                    return;
                }
                if max_deliveries.is_some_and(|max| count >= max) {
                    log::debug!(
                        "Giving up on message for '{}' after {} deliveries",
                        subject,
                        count
                    );
                    return;
                }
                count += 1;
                log::debug!(
                    "Redelivering unacked message for '{}' (delivery {})",
                    subject,
                    count
                );
                let redelivery = Arc::new(InMemoryDelivery {
                    acked: acked.clone(),
                    count,
                });
                if tx
                    .send(Envelope::new(subject.clone(), payload.clone(), redelivery))
                    .is_err()
                {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, subject: &str, payload: &Value) -> Result<(), TransportError> {
        if self.take_failure() {
            return Err(TransportError::Unavailable(format!(
                "publish to '{subject}' refused"
            )));
        }

        let mut data = self.data.lock().await;
        data.published
            .entry(subject.to_string())
            .or_default()
            .push(payload.clone());

        let Some(mut subscribers) = data.subscribers.remove(subject) else {
            log::debug!("No subscribers for '{}'", subject);
            return Ok(());
        };
        subscribers.retain(|s| !s.tx.is_closed());

        let mut groups: HashMap<&str, Vec<&Subscriber>> = HashMap::new();
        for subscriber in &subscribers {
            match &subscriber.queue_group {
                None => self.deliver(subject, payload, subscriber),
                Some(group) => groups.entry(group.as_str()).or_default().push(subscriber),
            }
        }
        for (group, members) in groups {
            let next = data
                .next_in_group
                .entry((subject.to_string(), group.to_string()))
                .or_default();
            let member = members[*next % members.len()];
            *next = next.wrapping_add(1);
            self.deliver(subject, payload, member);
        }

        data.subscribers.insert(subject.to_string(), subscribers);
        Ok(())
    }

    async fn subscribe(&self, options: SubscribeOptions) -> Result<EnvelopeStream, TransportError> {
        log::debug!(
            "Subscribing to '{}' (queue group {:?})",
            options.subject,
            options.queue_group
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let mut data = self.data.lock().await;
        data.subscribers
            .entry(options.subject)
            .or_default()
            .push(Subscriber {
                queue_group: options.queue_group,
                ack_wait: options.ack_wait,
                tx,
            });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

struct InMemoryDelivery {
    acked: Arc<AtomicBool>,
    count: u32,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acked.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn delivery_count(&self) -> u32 {
        self.count
    }
}
