//! Drains the dead-letter store back into the transport.
//!
//! One reconciler per replica is fine: claims are atomic in the store, so two
//! replicas never republish the same record in the same round. A replica that
//! crashes mid-publish leaves its record in `processing`; after
//! [`ReconcilerConfig::stuck_timeout`] the record becomes claimable again,
//! either directly by [`DeadLetterReconciler::reconcile_one`] or in bulk by
//! [`DeadLetterReconciler::recover_stuck`].

use crate::backoff::reconcile_retry_delay;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ProcessId, ReconcilerConfig};
use crate::dead_letter::{DeadLetterRecord, DeadLetterStore, DeadLetterStoreError};
use crate::transport::Transport;
use chrono::{DateTime, TimeDelta, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// What happened to a claimed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Republished and marked `completed`.
    Completed,
    /// Publishing failed; returned to `pending` with a later due time.
    Rescheduled {
        /// The new retry count.
        retry_count: u32,
        /// When the record becomes due again.
        next_retry_at: DateTime<Utc>,
    },
    /// Publishing failed and the retry budget is spent; marked `failed`.
    Failed {
        /// The final retry count.
        retry_count: u32,
    },
    /// The claim was taken over (stuck recovery) before this processor could
    /// record the result.
    LostClaim,
}

/// Totals of a [`DeadLetterReconciler::drain`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Records republished and completed.
    pub completed: u64,
    /// Records rescheduled after a failed publish.
    pub rescheduled: u64,
    /// Records moved to `failed`.
    pub failed: u64,
    /// Records whose claim was lost before the result was recorded.
    pub lost_claims: u64,
}

impl ReconcileSummary {
    /// Number of records claimed during the run.
    pub fn claimed(&self) -> u64 {
        self.completed + self.rescheduled + self.failed + self.lost_claims
    }

    fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Completed => self.completed += 1,
            ReconcileOutcome::Rescheduled { .. } => self.rescheduled += 1,
            ReconcileOutcome::Failed { .. } => self.failed += 1,
            ReconcileOutcome::LostClaim => self.lost_claims += 1,
        }
    }
}

struct ReconcilerState {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ReconcilerState {
    fn is_running(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::error!("Dead letter reconciler task failed: {}", e);
            }
        }
    }
}

/// Republishes due dead letters with exponential backoff.
///
/// Cheap to clone; clones share the background task started by
/// [`start`](DeadLetterReconciler::start).
#[derive(Clone)]
pub struct DeadLetterReconciler {
    store: Arc<dyn DeadLetterStore>,
    transport: Arc<dyn Transport>,
    config: ReconcilerConfig,
    processor_id: ProcessId,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<Option<ReconcilerState>>>,
}

impl DeadLetterReconciler {
    /// Creates a reconciler using the system clock and a [`ProcessId`] read
    /// from the environment.
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        transport: Arc<dyn Transport>,
        config: ReconcilerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            transport,
            config,
            processor_id: ProcessId::from_env(),
            clock: Arc::new(SystemClock),
            state: Arc::new(Mutex::new(None)),
        })
    }

    /// Sets the id written to `processor_id` on claimed records.
    pub fn with_processor_id(mut self, processor_id: ProcessId) -> Self {
        self.processor_id = processor_id;
        self
    }

    /// Sets the clock used for due times and stuck cut-offs.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the processor id.
    pub fn processor_id(&self) -> &ProcessId {
        &self.processor_id
    }

    fn stuck_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = TimeDelta::from_std(self.config.stuck_timeout).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Claims one due record and republishes it. Returns `None` when nothing
    /// is claimable.
    pub async fn reconcile_one(&self) -> Result<Option<ReconcileOutcome>, DeadLetterStoreError> {
        let now = self.clock.now();
        let Some(record) = self
            .store
            .claim_next(self.processor_id.as_str(), now, self.stuck_before(now))
            .await?
        else {
            return Ok(None);
        };

        log::debug!(
            "Claimed dead letter {} ('{}' on '{}', retry {}/{})",
            record.id,
            record.event_id,
            record.subject,
            record.retry_count,
            record.max_retries
        );

        let outcome = match self.transport.publish(&record.subject, &record.data).await {
            Ok(()) => self.complete(&record).await?,
            Err(e) => self.publish_failed(&record, &e.to_string()).await?,
        };
        Ok(Some(outcome))
    }

    async fn complete(
        &self,
        record: &DeadLetterRecord,
    ) -> Result<ReconcileOutcome, DeadLetterStoreError> {
        let marked = self
            .store
            .mark_completed(record.id, self.processor_id.as_str(), self.clock.now())
            .await?;
        if !marked {
            log::warn!(
                "Republished dead letter {} but lost the claim before marking it completed",
                record.id
            );
            return Ok(ReconcileOutcome::LostClaim);
        }
        log::info!(
            "Republished dead letter {} ('{}' on '{}')",
            record.id,
            record.event_id,
            record.subject
        );
        Ok(ReconcileOutcome::Completed)
    }

    async fn publish_failed(
        &self,
        record: &DeadLetterRecord,
        error: &str,
    ) -> Result<ReconcileOutcome, DeadLetterStoreError> {
        let retry_count = record.retry_count.saturating_add(1);

        if retry_count >= record.max_retries {
            let marked = self
                .store
                .mark_failed(record.id, self.processor_id.as_str(), retry_count, error)
                .await?;
            if !marked {
                return Ok(ReconcileOutcome::LostClaim);
            }
            log::error!(
                "Dead letter {} ('{}' on '{}') failed permanently after {} retries: {}",
                record.id,
                record.event_id,
                record.subject,
                retry_count,
                error
            );
            return Ok(ReconcileOutcome::Failed { retry_count });
        }

        let now = self.clock.now();
        let next_retry_at = now
            .checked_add_signed(reconcile_retry_delay(record.retry_count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let marked = self
            .store
            .reschedule(
                record.id,
                self.processor_id.as_str(),
                retry_count,
                next_retry_at,
                error,
            )
            .await?;
        if !marked {
            return Ok(ReconcileOutcome::LostClaim);
        }
        log::warn!(
            "Failed to republish dead letter {} (retry {}/{}), next attempt at {}: {}",
            record.id,
            retry_count,
            record.max_retries,
            next_retry_at,
            error
        );
        Ok(ReconcileOutcome::Rescheduled {
            retry_count,
            next_retry_at,
        })
    }

    /// Reconciles records until none is claimable.
    pub async fn drain(&self) -> Result<ReconcileSummary, DeadLetterStoreError> {
        let mut summary = ReconcileSummary::default();
        while let Some(outcome) = self.reconcile_one().await? {
            summary.record(&outcome);
        }
        if summary.claimed() > 0 {
            log::info!("Reconciliation round finished: {:?}", summary);
        }
        Ok(summary)
    }

    /// Returns every record stuck in `processing` to `pending`.
    pub async fn recover_stuck(&self) -> Result<u64, DeadLetterStoreError> {
        let reset = self
            .store
            .reset_stuck(self.stuck_before(self.clock.now()))
            .await?;
        if reset > 0 {
            log::warn!("Recovered {} stuck dead letters", reset);
        }
        Ok(reset)
    }

    /// Starts the background loops: [`drain`](Self::drain) every
    /// `poll_interval` and [`recover_stuck`](Self::recover_stuck) every
    /// `stuck_recovery_interval`, each on a task of its own so a long drain
    /// never delays recovery. Does nothing if already running.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref()
            && running.is_running()
        {
            log::debug!("Dead letter reconciler already running");
            return;
        }
        if let Some(stale) = state.take() {
            stale.stop().await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reconciler = self.clone();
        let poll = tokio::spawn(run_every(
            "dead letter reconciliation",
            self.config.poll_interval,
            shutdown_rx.clone(),
            move || {
                let reconciler = reconciler.clone();
                async move { reconciler.drain().await.map(|_| ()) }
            },
        ));

        let reconciler = self.clone();
        let recovery = tokio::spawn(run_every(
            "stuck dead letter recovery",
            self.config.stuck_recovery_interval,
            shutdown_rx,
            move || {
                let reconciler = reconciler.clone();
                async move { reconciler.recover_stuck().await.map(|_| ()) }
            },
        ));

        log::info!(
            "Dead letter reconciler started as '{}' (poll every {:?}, stuck recovery every {:?})",
            self.processor_id,
            self.config.poll_interval,
            self.config.stuck_recovery_interval
        );
        *state = Some(ReconcilerState {
            shutdown_tx,
            handles: vec![poll, recovery],
        });
    }

    /// Stops the background loops and waits for their current rounds to finish.
    pub async fn shutdown(&self) {
        let Some(running) = self.state.lock().await.take() else {
            return;
        };
        running.stop().await;
        log::info!("Dead letter reconciler stopped");
    }

    /// Whether the background loops are running.
    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(ReconcilerState::is_running)
    }
}

/// Runs `round` every `period` until `shutdown` flips to `true`.
async fn run_every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut round: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), DeadLetterStoreError>>,
{
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if let Err(e) = round().await {
                    log::error!("{} failed: {}", name, e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    log::debug!("Stopped {} loop", name);
}

impl std::fmt::Debug for DeadLetterReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterReconciler")
            .field("config", &self.config)
            .field("processor_id", &self.processor_id)
            .finish()
    }
}
