use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// An in-memory [`DeadLetterStore`].
///
/// Every operation runs under one lock, which makes claims atomic.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryDeadLetterStore");
        Self::default()
    }

    /// Makes every subsequent operation fail with
    /// [`DeadLetterStoreError::Unavailable`] until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every record, in insertion order.
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.clone()
    }

    /// Writes a record as-is, replacing any record with the same id.
    ///
    /// Lets tests stage states such as a claim abandoned by a crashed replica.
    pub async fn put(&self, record: DeadLetterRecord) {
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    fn check_available(&self) -> Result<(), DeadLetterStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeadLetterStoreError::Unavailable(
                "in-memory dead letter store is switched off".to_string(),
            ));
        }
        Ok(())
    }
}

fn claimed_by<'a>(
    records: &'a mut [DeadLetterRecord],
    id: Uuid,
    processor_id: &str,
) -> Option<&'a mut DeadLetterRecord> {
    records
        .iter_mut()
        .find(|r| r.id == id && r.is_claimed_by(processor_id))
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, record: NewDeadLetter) -> Result<DeadLetterRecord, DeadLetterStoreError> {
        self.check_available()?;
        let record = DeadLetterRecord::from_new(Uuid::new_v4(), record);
        log::debug!(
            "Storing dead letter {} for event '{}' on '{}'",
            record.id,
            record.event_id,
            record.subject
        );
        self.records.lock().await.push(record.clone());
        Ok(record)
    }

    async fn claim_next(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterStoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let Some(record) = records
            .iter_mut()
            .filter(|r| r.is_claimable(now, stuck_before))
            .min_by_key(|r| r.next_retry_at)
        else {
            return Ok(None);
        };
        record.status = DeadLetterStatus::Processing;
        record.processor_id = Some(processor_id.to_string());
        record.processing_started_at = Some(now);
        Ok(Some(record.clone()))
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        processor_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterStoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let Some(record) = claimed_by(&mut records, id, processor_id) else {
            return Ok(false);
        };
        record.status = DeadLetterStatus::Completed;
        record.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        processor_id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, DeadLetterStoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let Some(record) = claimed_by(&mut records, id, processor_id) else {
            return Ok(false);
        };
        record.status = DeadLetterStatus::Pending;
        record.retry_count = retry_count;
        record.next_retry_at = next_retry_at;
        record.error = error.to_string();
        record.processor_id = None;
        record.processing_started_at = None;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        processor_id: &str,
        retry_count: u32,
        error: &str,
    ) -> Result<bool, DeadLetterStoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let Some(record) = claimed_by(&mut records, id, processor_id) else {
            return Ok(false);
        };
        record.status = DeadLetterStatus::Failed;
        record.retry_count = retry_count;
        record.error = error.to_string();
        Ok(true)
    }

    async fn reset_stuck(&self, stuck_before: DateTime<Utc>) -> Result<u64, DeadLetterStoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let mut reset = 0;
        for record in records.iter_mut().filter(|r| {
            r.status == DeadLetterStatus::Processing
                && r.processing_started_at.is_some_and(|at| at < stuck_before)
        }) {
            record.status = DeadLetterStatus::Pending;
            record.processor_id = None;
            record.processing_started_at = None;
            reset += 1;
        }
        Ok(reset)
    }

    async fn requeue(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterStoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let Some(record) = records
            .iter_mut()
            .find(|r| r.id == id && r.status != DeadLetterStatus::Processing)
        else {
            return Ok(false);
        };
        record.status = DeadLetterStatus::Pending;
        record.next_retry_at = next_retry_at;
        record.completed_at = None;
        if record.retry_count >= record.max_retries {
            record.max_retries = record.retry_count + 1;
        }
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DeadLetterStoreError> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeadLetterRecord>, DeadLetterStoreError> {
        self.check_available()?;
        let records = self.records.lock().await;
        let mut matching: Vec<_> = records
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.timestamp);
        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count(&self, status: Option<DeadLetterStatus>) -> Result<u64, DeadLetterStoreError> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .count() as u64)
    }

    async fn remove(&self, id: Uuid) -> Result<bool, DeadLetterStoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    fn new_dead_letter(now: DateTime<Utc>, event_id: &str) -> NewDeadLetter {
        NewDeadLetter {
            subject: "OrderCreated".to_string(),
            event_id: event_id.to_string(),
            data: json!({"list": [{"entity": "order", "id": event_id}]}),
            error: "timeout".to_string(),
            retry_count: 5,
            max_retries: 10,
            service: "orders".to_string(),
            next_retry_at: now,
            timestamp: now,
        }
    }

    #[tokio::test]
    async fn claims_are_exclusive() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        store.insert(new_dead_letter(now, "a")).await.unwrap();
        let stuck_before = now - TimeDelta::minutes(10);

        let first = store.claim_next("p1", now, stuck_before).await.unwrap();
        let second = store.claim_next("p2", now, stuck_before).await.unwrap();

        let first = first.unwrap();
        assert_eq!(first.status, DeadLetterStatus::Processing);
        assert_eq!(first.processor_id.as_deref(), Some("p1"));
        assert_eq!(first.processing_started_at, Some(now));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claims_take_the_earliest_due_record() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let mut later = new_dead_letter(now, "later");
        later.next_retry_at = now - TimeDelta::minutes(1);
        let mut earlier = new_dead_letter(now, "earlier");
        earlier.next_retry_at = now - TimeDelta::minutes(5);
        store.insert(later).await.unwrap();
        store.insert(earlier).await.unwrap();

        let claimed = store
            .claim_next("p1", now, now - TimeDelta::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.event_id, "earlier");
    }

    #[tokio::test]
    async fn transitions_are_guarded_on_the_claimant() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let record = store.insert(new_dead_letter(now, "a")).await.unwrap();
        store
            .claim_next("p1", now, now - TimeDelta::minutes(10))
            .await
            .unwrap();

        assert!(!store.mark_completed(record.id, "p2", now).await.unwrap());
        assert!(
            !store
                .reschedule(record.id, "p2", 6, now, "boom")
                .await
                .unwrap()
        );
        assert!(store.mark_completed(record.id, "p1", now).await.unwrap());

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeadLetterStatus::Completed);
        assert_eq!(stored.completed_at, Some(now));
    }

    #[tokio::test]
    async fn reset_stuck_only_touches_old_claims() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let old = store.insert(new_dead_letter(now, "old")).await.unwrap();
        let fresh = store.insert(new_dead_letter(now, "fresh")).await.unwrap();

        let mut stuck = store.get(old.id).await.unwrap().unwrap();
        stuck.status = DeadLetterStatus::Processing;
        stuck.processor_id = Some("crashed".to_string());
        stuck.processing_started_at = Some(now - TimeDelta::minutes(20));
        store.put(stuck).await;
        store
            .claim_next("p1", now, now - TimeDelta::minutes(10))
            .await
            .unwrap();

        assert_eq!(
            store.reset_stuck(now - TimeDelta::minutes(10)).await.unwrap(),
            1
        );
        let old = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, DeadLetterStatus::Pending);
        assert!(old.processor_id.is_none());
        let fresh = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, DeadLetterStatus::Processing);
    }

    #[tokio::test]
    async fn requeue_revives_failed_records() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let mut failed = DeadLetterRecord::from_new(Uuid::new_v4(), new_dead_letter(now, "a"));
        failed.status = DeadLetterStatus::Failed;
        failed.retry_count = 10;
        store.put(failed.clone()).await;

        assert!(store.requeue(failed.id, now).await.unwrap());
        let record = store.get(failed.id).await.unwrap().unwrap();
        assert_eq!(record.status, DeadLetterStatus::Pending);
        assert!(record.is_claimable(now, now - TimeDelta::minutes(10)));
    }

    #[tokio::test]
    async fn list_count_and_remove() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let a = store.insert(new_dead_letter(now, "a")).await.unwrap();
        store
            .insert(new_dead_letter(now + TimeDelta::seconds(1), "b"))
            .await
            .unwrap();

        assert_eq!(store.count(None).await.unwrap(), 2);
        assert_eq!(
            store.count(Some(DeadLetterStatus::Failed)).await.unwrap(),
            0
        );
        let page = store
            .list(Some(DeadLetterStatus::Pending), 1, 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].event_id, "b");

        assert!(store.remove(a.id).await.unwrap());
        assert!(!store.remove(a.id).await.unwrap());
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_inserts() {
        let store = InMemoryDeadLetterStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.insert(new_dead_letter(Utc::now(), "a")).await,
            Err(DeadLetterStoreError::Unavailable(_))
        ));
    }
}
