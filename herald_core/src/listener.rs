//! The listener core: reliable processing around an at-least-once subscription.
//!
//! Every delivered message goes through the same state machine:
//!
//! ```text
//! Received ─▶ LockAttempted ─▶ Processing ─┬─▶ Acked
//!                  │                        ├─▶ RetryScheduled   (no ack, transport redelivers)
//!                  │                        └─▶ DeadLettered     (dead letter written, then ack)
//!                  └─ lock held ─▶ Redeliver | wait and retry once | SkippedInFlight
//! ```
//!
//! Processing errors never escape to the transport: each message resolves to
//! an ack, no ack (implicit redelivery), or dead-letter-then-ack.

use crate::backoff::immediate_retry_delay;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ListenerConfig, ProcessId, RetryCounterConfig};
use crate::dead_letter::{DeadLetterStore, NewDeadLetter};
use crate::envelope::Envelope;
use crate::error::ProcessingError;
use crate::handler::EventHandler;
use crate::identity::{DefaultIdentity, EventIdentity, default_event_id};
use crate::kv::{KeyTtl, KeyValueStore};
use crate::lock::{DistributedLock, lock_key};
use crate::retry_counter::RetryCounter;
use crate::telemetry::{ListenerMetrics, NoopMetrics, NoopTracer, SpanGuard, Tracer};
use crate::transport::{SubscribeOptions, Transport, TransportError};
use chrono::TimeDelta;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// How a delivered message was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler succeeded and the message was acked.
    Acked,
    /// Another replica holds a long-lived lock on the event; acked without work.
    SkippedInFlight,
    /// Left un-acked without counting an attempt; the transport will redeliver.
    Redeliver,
    /// The handler failed with a retryable error; left un-acked.
    RetryScheduled {
        /// Failed attempts recorded so far.
        attempt: u32,
    },
    /// Retries were exhausted; a dead letter was written and the message acked.
    DeadLettered {
        /// Id of the dead-letter record.
        record_id: Uuid,
        /// Failed attempts recorded on the record.
        retry_count: u32,
    },
    /// Retries were exhausted with dead-lettering disabled; acked.
    Exhausted {
        /// Failed attempts recorded.
        retry_count: u32,
    },
    /// The side effect already exists; acked without retry or dead letter.
    DuplicateKey,
}

impl Outcome {
    /// Short name, used as a span attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acked => "acked",
            Outcome::SkippedInFlight => "skipped_in_flight",
            Outcome::Redeliver => "redeliver",
            Outcome::RetryScheduled { .. } => "retry_scheduled",
            Outcome::DeadLettered { .. } => "dead_lettered",
            Outcome::Exhausted { .. } => "exhausted",
            Outcome::DuplicateKey => "duplicate_key",
        }
    }

    /// Whether the message was acknowledged.
    pub fn is_acked(&self) -> bool {
        !matches!(self, Outcome::Redeliver | Outcome::RetryScheduled { .. })
    }
}

/// Runs `op` and retries it up to `retries` more times in-process, sleeping
/// `base_delay * 2^n` between attempts.
///
/// Gives up early on errors that are not retryable, including duplicate keys.
pub async fn retry_immediately<T, F, Fut>(
    retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, ProcessingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProcessingError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= retries || error.is_duplicate_key() || !error.class().is_retryable() {
                    return Err(error);
                }
                let delay = immediate_retry_delay(base_delay, attempt);
                log::debug!(
                    "Immediate retry {}/{} in {:?} after: {}",
                    attempt + 1,
                    retries,
                    delay,
                    error
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Errors returned when starting or stopping a [`Subscription`].
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The transport refused the subscription.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// The consumer task panicked.
    #[error("Subscription task panicked: {0}")]
    TaskPanicked(String),
}

/// Wraps event handlers with locking, retry bookkeeping and the dead-letter
/// hand-off.
///
/// Constructed once per process and shared (it is cheap to clone) between
/// every subscription of that process.
#[derive(Clone)]
pub struct ListenerCore {
    config: Arc<ListenerConfig>,
    process_id: ProcessId,
    kv: Arc<dyn KeyValueStore>,
    lock: DistributedLock,
    retries: RetryCounter,
    dead_letters: Arc<dyn DeadLetterStore>,
    identity: Arc<dyn EventIdentity>,
    tracer: Arc<dyn Tracer>,
    metrics: Arc<dyn ListenerMetrics>,
    clock: Arc<dyn Clock>,
}

impl ListenerCore {
    /// Creates a listener with the default identity rule, no-op tracing and
    /// metrics, the system clock and a [`ProcessId`] read from the environment.
    ///
    /// The retry counter window is derived from `ack_wait` (see
    /// [`ListenerConfig::retry_counter_config`]).
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: ListenerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let retries = RetryCounter::with_config(kv.clone(), config.retry_counter_config());
        Ok(Self {
            config: Arc::new(config),
            process_id: ProcessId::from_env(),
            lock: DistributedLock::new(kv.clone()),
            kv,
            retries,
            dead_letters,
            identity: Arc::new(DefaultIdentity),
            tracer: Arc::new(NoopTracer),
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        })
    }

    /// Sets the process id used as lock owner token.
    pub fn with_process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = process_id;
        self
    }

    /// Sets the rule deriving event ids for handlers that don't supply one.
    pub fn with_identity(mut self, identity: Arc<dyn EventIdentity>) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the tracer.
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Sets the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn ListenerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the clock used for dead-letter timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the retry counter expiry settings.
    ///
    /// Fails if the first window is shorter than two `ack_wait` periods.
    pub fn with_retry_counter(mut self, config: RetryCounterConfig) -> Result<Self, ConfigError> {
        config.validate(self.config.ack_wait)?;
        self.retries = RetryCounter::with_config(self.kv.clone(), config);
        Ok(self)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Returns the process id.
    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    /// Returns the retry counter.
    pub fn retry_counter(&self) -> &RetryCounter {
        &self.retries
    }

    /// The identity of the event carried by `envelope`.
    pub fn event_id<H>(&self, handler: &H, envelope: &Envelope) -> String
    where
        H: EventHandler + ?Sized,
    {
        handler
            .event_id(envelope)
            .or_else(|| self.identity.event_id(&envelope.subject, &envelope.payload))
            .unwrap_or_else(|| default_event_id(&envelope.subject, &envelope.payload))
    }

    /// Processes one delivered message and resolves it.
    pub async fn handle<H>(&self, handler: &H, envelope: &Envelope) -> Outcome
    where
        H: EventHandler + ?Sized,
    {
        let event_id = self.event_id(handler, envelope);
        let mut span = SpanGuard::new(self.tracer.start_span(
            "herald.listener.handle",
            &[
                ("subject", envelope.subject.clone()),
                ("event_id", event_id.clone()),
                ("delivery_count", envelope.delivery_count().to_string()),
            ],
        ));

        let outcome = match self.process(handler, envelope, &event_id).await {
            Ok(outcome) => outcome,
            Err(error) => {
                span.record_error(&error.to_string());
                self.resolve_failure(envelope, &event_id, error).await
            }
        };

        span.set_attribute("outcome", outcome.as_str().to_string());
        outcome
    }

    async fn process<H>(
        &self,
        handler: &H,
        envelope: &Envelope,
        event_id: &str,
    ) -> Result<Outcome, ProcessingError>
    where
        H: EventHandler + ?Sized,
    {
        if !self.config.enable_lock {
            self.run_handler(handler, envelope).await?;
            return Ok(self.complete(envelope, event_id).await);
        }

        let key = lock_key(&envelope.subject, event_id);
        let owner = self.process_id.as_str();

        if self.lock.acquire(&key, owner, self.config.lock_timeout).await? {
            return self.process_locked(handler, envelope, event_id, &key).await;
        }

        match self.lock.remaining_ttl(&key).await? {
            KeyTtl::Missing => {
                // Released or expired between SET NX and TTL. Let the
                // transport redeliver rather than racing for it here.
                log::debug!(
                    "Lock '{}' vanished while checking its TTL, leaving event '{}' for redelivery",
                    key,
                    event_id
                );
                sleep(self.config.lock_race_delay).await;
                Ok(Outcome::Redeliver)
            }
            KeyTtl::Expires(remaining) if remaining < self.config.lock_expiring_threshold => {
                let wait = remaining + self.config.lock_expiry_buffer;
                log::debug!(
                    "Lock '{}' expires in {:?}, waiting {:?} before retrying acquisition",
                    key,
                    remaining,
                    wait
                );
                sleep(wait).await;
                if self.lock.acquire(&key, owner, self.config.lock_timeout).await? {
                    self.process_locked(handler, envelope, event_id, &key).await
                } else {
                    log::debug!(
                        "Lock '{}' still held after waiting, leaving event '{}' for redelivery",
                        key,
                        event_id
                    );
                    Ok(Outcome::Redeliver)
                }
            }
            ttl => {
                log::debug!(
                    "Event '{}' on '{}' is being processed by another replica (lock ttl {:?}), skipping",
                    event_id,
                    envelope.subject,
                    ttl
                );
                self.ack(envelope, event_id).await;
                self.metrics.on_skip(&envelope.subject);
                Ok(Outcome::SkippedInFlight)
            }
        }
    }

    async fn process_locked<H>(
        &self,
        handler: &H,
        envelope: &Envelope,
        event_id: &str,
        key: &str,
    ) -> Result<Outcome, ProcessingError>
    where
        H: EventHandler + ?Sized,
    {
        let result = match self.run_handler(handler, envelope).await {
            Ok(()) => Ok(self.complete(envelope, event_id).await),
            Err(error) => Err(error),
        };

        if let Err(e) = self.lock.release(key, self.process_id.as_str()).await {
            log::warn!(
                "Failed to release lock '{}', it will expire in at most {:?}: {}",
                key,
                self.config.lock_timeout,
                e
            );
        }

        result
    }

    async fn run_handler<H>(&self, handler: &H, envelope: &Envelope) -> Result<(), ProcessingError>
    where
        H: EventHandler + ?Sized,
    {
        retry_immediately(
            self.config.immediate_retries,
            self.config.immediate_retry_base_delay,
            || handler.handle(envelope),
        )
        .await
    }

    async fn complete(&self, envelope: &Envelope, event_id: &str) -> Outcome {
        if let Err(e) = self.retries.reset(&envelope.subject, event_id).await {
            log::warn!(
                "Failed to reset retry counter for event '{}' on '{}': {}",
                event_id,
                envelope.subject,
                e
            );
        }
        self.ack(envelope, event_id).await;
        self.metrics.on_success(&envelope.subject);
        log::debug!("Processed event '{}' on '{}'", event_id, envelope.subject);
        Outcome::Acked
    }

    async fn resolve_failure(
        &self,
        envelope: &Envelope,
        event_id: &str,
        error: ProcessingError,
    ) -> Outcome {
        let subject = envelope.subject.as_str();

        if error.is_duplicate_key() {
            // The record already exists. Redelivery would loop forever.
            log::info!(
                "Event '{}' on '{}' hit a duplicate key, acking without retry: {}",
                event_id,
                subject,
                error
            );
            self.ack(envelope, event_id).await;
            self.metrics.on_duplicate(subject);
            return Outcome::DuplicateKey;
        }

        let class = error.class();
        let attempt = match self.retries.increment(subject, event_id).await {
            Ok(attempt) => attempt,
            Err(e) => {
                log::error!(
                    "Failed to record attempt for event '{}' on '{}' ({}), leaving it for redelivery: {}",
                    event_id,
                    subject,
                    e,
                    error
                );
                return Outcome::Redeliver;
            }
        };

        if class.is_retryable() && RetryCounter::allows_retry(attempt, self.config.max_retries) {
            log::warn!(
                "Failed processing event '{}' on '{}' (attempt {}/{}), awaiting redelivery: {}",
                event_id,
                subject,
                attempt,
                self.config.max_retries,
                error
            );
            self.metrics.on_retry(subject, attempt);
            return Outcome::RetryScheduled { attempt };
        }

        if class.is_retryable() {
            log::error!(
                "Failed processing event '{}' on '{}' after {} attempts: {}",
                event_id,
                subject,
                attempt,
                error
            );
        } else {
            log::error!(
                "Permanent failure processing event '{}' on '{}', not retrying: {}",
                event_id,
                subject,
                error
            );
        }

        self.exhaust(envelope, event_id, &error, attempt).await
    }

    async fn exhaust(
        &self,
        envelope: &Envelope,
        event_id: &str,
        error: &ProcessingError,
        attempt: u32,
    ) -> Outcome {
        let subject = envelope.subject.as_str();

        if !self.config.enable_dead_letter {
            self.ack(envelope, event_id).await;
            self.metrics.on_exhausted(subject);
            return Outcome::Exhausted {
                retry_count: attempt,
            };
        }

        let now = self.clock.now();
        let initial_delay =
            TimeDelta::from_std(self.config.dead_letter_initial_delay).unwrap_or(TimeDelta::MAX);
        let record = NewDeadLetter {
            subject: subject.to_string(),
            event_id: event_id.to_string(),
            data: envelope.payload.clone(),
            error: error.to_string(),
            retry_count: attempt,
            // Reconciliation attempts are granted on top of the ones already spent.
            max_retries: attempt.saturating_add(self.config.dead_letter_max_retries),
            service: self.config.service.clone(),
            next_retry_at: now.checked_add_signed(initial_delay).unwrap_or(now),
            timestamp: now,
        };

        match self.dead_letters.insert(record).await {
            Ok(stored) => {
                log::info!(
                    "Event '{}' on '{}' dead-lettered as {} after {} attempts",
                    event_id,
                    subject,
                    stored.id,
                    attempt
                );
                if let Err(e) = self.retries.reset(subject, event_id).await {
                    log::warn!(
                        "Failed to reset retry counter for dead-lettered event '{}': {}",
                        event_id,
                        e
                    );
                }
                self.ack(envelope, event_id).await;
                self.metrics.on_dead_letter(subject);
                Outcome::DeadLettered {
                    record_id: stored.id,
                    retry_count: attempt,
                }
            }
            Err(e) => {
                log::error!(
                    "Failed to dead-letter event '{}' on '{}', leaving it for redelivery: {}",
                    event_id,
                    subject,
                    e
                );
                Outcome::Redeliver
            }
        }
    }

    async fn ack(&self, envelope: &Envelope, event_id: &str) {
        if let Err(e) = envelope.ack().await {
            log::warn!(
                "Failed to ack event '{}' on '{}', it may be redelivered: {}",
                event_id,
                envelope.subject,
                e
            );
        }
    }

    /// Subscribes `handler` to its subject and processes every delivery on a
    /// task of its own.
    ///
    /// Dropping the returned [`Subscription`] stops consumption.
    pub async fn subscribe<H>(
        &self,
        transport: Arc<dyn Transport>,
        handler: Arc<H>,
    ) -> Result<Subscription, SubscriptionError>
    where
        H: EventHandler + ?Sized + 'static,
    {
        let subject = handler.subject().to_string();
        let options = SubscribeOptions {
            subject: subject.clone(),
            queue_group: self.config.queue_group.clone(),
            ack_wait: self.config.ack_wait,
        };
        let mut stream = transport.subscribe(options).await?;
        log::info!(
            "Subscribed to '{}' (queue group {:?}) as '{}'",
            subject,
            self.config.queue_group,
            self.process_id
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let listener = self.clone();
        let task_subject = subject.clone();

        let handle = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(envelope) => {
                            let listener = listener.clone();
                            let handler = handler.clone();
                            in_flight.spawn(async move {
                                listener.handle(handler.as_ref(), &envelope).await;
                            });
                        }
                        None => {
                            log::info!("Subscription to '{}' ended", task_subject);
                            break;
                        }
                    },
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = joined {
                            log::error!("Handler task for '{}' failed: {}", task_subject, e);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            log::info!("Stopping subscription to '{}'", task_subject);
                            break;
                        }
                    }
                }
            }

            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    log::error!("Handler task for '{}' failed: {}", task_subject, e);
                }
            }
        });

        Ok(Subscription {
            subject,
            handle,
            shutdown_tx,
        })
    }
}

impl std::fmt::Debug for ListenerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCore")
            .field("config", &self.config)
            .field("process_id", &self.process_id)
            .finish()
    }
}

/// A running subscription started by [`ListenerCore::subscribe`].
pub struct Subscription {
    subject: String,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Subscription {
    /// Subject this subscription consumes.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether the consumer task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops receiving new messages and waits for in-flight handlers.
    ///
    /// Messages still un-acked are redelivered by the transport.
    pub async fn shutdown(self) -> Result<(), SubscriptionError> {
        let _ = self.shutdown_tx.send(true);
        self.handle
            .await
            .map_err(|e| SubscriptionError::TaskPanicked(e.to_string()))?;
        log::info!("Subscription to '{}' shut down gracefully", self.subject);
        Ok(())
    }
}
