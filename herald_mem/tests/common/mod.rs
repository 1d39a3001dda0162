#![allow(dead_code)]

use async_trait::async_trait;
use herald_core::prelude::*;
use herald_mem::{InMemoryDeadLetterStore, InMemoryKeyValueStore, InMemoryMetrics};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Asserts that virtual time moved forward by `expected`, give or take a tick.
pub fn assert_elapsed(started: tokio::time::Instant, expected: Duration) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(10),
        "expected {expected:?} to elapse, got {elapsed:?}"
    );
}

pub fn order_created() -> Value {
    json!({"list": [{"entity": "order", "id": "abc123"}], "total": 42})
}

/// A handler that fails with queued errors, then with `always` if set, and
/// otherwise succeeds.
pub struct ScriptedHandler {
    subject: String,
    failures: Mutex<VecDeque<ProcessingError>>,
    always: Option<ProcessingError>,
    delay: Duration,
    calls: AtomicU32,
    successes: AtomicU32,
}

impl ScriptedHandler {
    pub fn succeeding(subject: &str) -> Self {
        Self::failing(subject, vec![])
    }

    pub fn failing(subject: &str, failures: Vec<ProcessingError>) -> Self {
        Self {
            subject: subject.to_string(),
            failures: Mutex::new(failures.into()),
            always: None,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            successes: AtomicU32::new(0),
        }
    }

    pub fn always_failing(subject: &str, error: ProcessingError) -> Self {
        Self {
            always: Some(error),
            ..Self::succeeding(subject)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> u32 {
        self.successes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<(), ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.failures.lock().unwrap().pop_front();
        if let Some(error) = queued.or_else(|| self.always.clone()) {
            return Err(error);
        }
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A delivery that records acks, for driving `ListenerCore::handle` directly.
#[derive(Default)]
pub struct TestDelivery {
    acks: AtomicU32,
    failing: AtomicBool,
}

impl TestDelivery {
    pub fn acked(&self) -> bool {
        self.acks.load(Ordering::SeqCst) > 0
    }

    pub fn acks(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn fail_acks(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Delivery for TestDelivery {
    async fn ack(&self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn envelope(subject: &str, payload: Value) -> (Envelope, Arc<TestDelivery>) {
    let delivery = Arc::new(TestDelivery::default());
    (Envelope::new(subject, payload, delivery.clone()), delivery)
}

pub struct Fixture {
    pub listener: ListenerCore,
    pub kv: InMemoryKeyValueStore,
    pub dead_letters: InMemoryDeadLetterStore,
    pub metrics: Arc<InMemoryMetrics>,
}

pub fn quick_config() -> ListenerConfig {
    ListenerConfig {
        immediate_retries: 0,
        service: "orders".to_string(),
        ..ListenerConfig::default()
    }
}

pub fn fixture(config: ListenerConfig) -> Fixture {
    let kv = InMemoryKeyValueStore::new();
    let dead_letters = InMemoryDeadLetterStore::new();
    fixture_with(Arc::new(kv.clone()), kv, dead_letters, config)
}

pub fn fixture_with(
    store: Arc<dyn KeyValueStore>,
    kv: InMemoryKeyValueStore,
    dead_letters: InMemoryDeadLetterStore,
    config: ListenerConfig,
) -> Fixture {
    let metrics = Arc::new(InMemoryMetrics::new());
    let listener = ListenerCore::new(store, Arc::new(dead_letters.clone()), config)
        .unwrap()
        .with_process_id(ProcessId::new("worker-a"))
        .with_metrics(metrics.clone());
    Fixture {
        listener,
        kv,
        dead_letters,
        metrics,
    }
}
