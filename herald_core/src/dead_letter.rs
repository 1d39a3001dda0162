//! Dead letters: durable records of events that exhausted their retries.
//!
//! A record moves through a small state machine:
//!
//! ```text
//! pending ──claim──▶ processing ──republished──▶ completed
//!    ▲                  │
//!    └──── reschedule ──┤
//!                       └── retry_count >= max_retries ──▶ failed
//! ```
//!
//! Every transition out of `processing` is guarded by
//! `status = processing AND processor_id = <claimant>`, so a stale claimant can
//! never clobber a record that was reclaimed by someone else.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a [`DeadLetterRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Waiting for `next_retry_at`.
    Pending,
    /// Claimed by a reconciler.
    Processing,
    /// Republished successfully. Terminal.
    Completed,
    /// Exceeded `max_retries` reconciliation attempts. Terminal.
    Failed,
}

impl DeadLetterStatus {
    /// The stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Processing => "processing",
            DeadLetterStatus::Completed => "completed",
            DeadLetterStatus::Failed => "failed",
        }
    }

    /// Whether no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeadLetterStatus::Completed | DeadLetterStatus::Failed)
    }
}

impl std::fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadLetterStatus {
    type Err = DeadLetterStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeadLetterStatus::Pending),
            "processing" => Ok(DeadLetterStatus::Processing),
            "completed" => Ok(DeadLetterStatus::Completed),
            "failed" => Ok(DeadLetterStatus::Failed),
            other => Err(DeadLetterStoreError::Serialization(format!(
                "unknown dead letter status '{other}'"
            ))),
        }
    }
}

/// A dead letter as written by the listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDeadLetter {
    /// Topic of the original message.
    pub subject: String,
    /// Identity of the event.
    pub event_id: String,
    /// The original payload, verbatim.
    pub data: Value,
    /// Last error message.
    pub error: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Reconciliation attempts allowed before the record is marked `failed`.
    pub max_retries: u32,
    /// Service that gave up on the event.
    pub service: String,
    /// Earliest time the reconciler may pick the record up.
    pub next_retry_at: DateTime<Utc>,
    /// When the event was dead-lettered.
    pub timestamp: DateTime<Utc>,
}

/// A persisted dead letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Unique identifier of the record.
    pub id: Uuid,
    /// Topic of the original message.
    pub subject: String,
    /// Identity of the event.
    pub event_id: String,
    /// The original payload, verbatim.
    pub data: Value,
    /// Last error message.
    pub error: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Reconciliation attempts allowed before the record is marked `failed`.
    pub max_retries: u32,
    /// Service that gave up on the event.
    pub service: String,
    /// Earliest time the reconciler may pick the record up.
    pub next_retry_at: DateTime<Utc>,
    /// When the event was dead-lettered.
    pub timestamp: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: DeadLetterStatus,
    /// Reconciler currently holding the record.
    pub processor_id: Option<String>,
    /// When the current claim was taken.
    pub processing_started_at: Option<DateTime<Utc>>,
    /// When the record reached `completed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    /// Materializes a freshly inserted record.
    pub fn from_new(id: Uuid, new: NewDeadLetter) -> Self {
        Self {
            id,
            subject: new.subject,
            event_id: new.event_id,
            data: new.data,
            error: new.error,
            retry_count: new.retry_count,
            max_retries: new.max_retries,
            service: new.service,
            next_retry_at: new.next_retry_at,
            timestamp: new.timestamp,
            status: DeadLetterStatus::Pending,
            processor_id: None,
            processing_started_at: None,
            completed_at: None,
        }
    }

    /// Whether a reconciler may claim this record at `now`.
    ///
    /// Either the record is `pending`, due and under its retry budget, or it is
    /// `processing` with a claim older than `stuck_before`.
    pub fn is_claimable(&self, now: DateTime<Utc>, stuck_before: DateTime<Utc>) -> bool {
        match self.status {
            DeadLetterStatus::Pending => {
                self.next_retry_at <= now && self.retry_count < self.max_retries
            }
            DeadLetterStatus::Processing => self
                .processing_started_at
                .is_some_and(|started| started < stuck_before),
            _ => false,
        }
    }

    /// Whether `processor_id` currently holds the claim on this record.
    pub fn is_claimed_by(&self, processor_id: &str) -> bool {
        self.status == DeadLetterStatus::Processing
            && self.processor_id.as_deref() == Some(processor_id)
    }
}

/// Errors returned by a [`DeadLetterStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeadLetterStoreError {
    /// The store could not be reached.
    #[error("Dead letter store unavailable: {0}")]
    Unavailable(String),
    /// A record with the same identity already exists.
    #[error("Duplicate dead letter: {0}")]
    DuplicateKey(String),
    /// The underlying database reported an error.
    #[error("Dead letter store error: {0}")]
    Database(String),
    /// A record could not be encoded or decoded.
    #[error("Dead letter serialization error: {0}")]
    Serialization(String),
}

/// Durable storage for dead letters.
///
/// Implementations must make [`claim_next`](DeadLetterStore::claim_next) a
/// single atomic find-and-update, and guard the `mark_*`/`reschedule`
/// transitions on the claimant.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persists a new record in `pending`.
    async fn insert(&self, record: NewDeadLetter) -> Result<DeadLetterRecord, DeadLetterStoreError>;

    /// Atomically claims one claimable record (see
    /// [`DeadLetterRecord::is_claimable`]), setting `status = processing`,
    /// `processor_id` and `processing_started_at = now` together.
    async fn claim_next(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterStoreError>;

    /// Marks a claimed record `completed`. Returns `false` if the claim was lost.
    async fn mark_completed(
        &self,
        id: Uuid,
        processor_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterStoreError>;

    /// Returns a claimed record to `pending` with a new retry count and due
    /// time, clearing ownership. Returns `false` if the claim was lost.
    async fn reschedule(
        &self,
        id: Uuid,
        processor_id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, DeadLetterStoreError>;

    /// Marks a claimed record `failed`. Returns `false` if the claim was lost.
    async fn mark_failed(
        &self,
        id: Uuid,
        processor_id: &str,
        retry_count: u32,
        error: &str,
    ) -> Result<bool, DeadLetterStoreError>;

    /// Resets every `processing` record claimed before `stuck_before` back to
    /// `pending`, clearing ownership. Returns how many were reset.
    async fn reset_stuck(&self, stuck_before: DateTime<Utc>) -> Result<u64, DeadLetterStoreError>;

    /// Operator requeue: puts a non-processing record back to `pending`, due at
    /// `next_retry_at`, granting one more attempt if its budget is spent.
    /// Returns `false` if the record doesn't exist or is currently claimed.
    async fn requeue(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterStoreError>;

    /// Fetches a record by id.
    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DeadLetterStoreError>;

    /// Lists records, oldest first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeadLetterRecord>, DeadLetterStoreError>;

    /// Counts records, optionally filtered by status.
    async fn count(&self, status: Option<DeadLetterStatus>) -> Result<u64, DeadLetterStoreError>;

    /// Deletes a record. Returns `true` if it existed.
    async fn remove(&self, id: Uuid) -> Result<bool, DeadLetterStoreError>;
}
