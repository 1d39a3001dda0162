//! An order pipeline whose payment gateway is down for the first few
//! deliveries. The listener retries, gives up into the dead-letter store and
//! the reconciler republishes the order once the gateway is back.
//!
//! Run with `RUST_LOG=info cargo run --example order-pipeline`.

use herald::prelude::*;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct OrderCreated {
    list: Vec<OrderRef>,
    total: u64,
}

#[derive(Debug, Deserialize)]
struct OrderRef {
    id: String,
}

struct ChargeOrder {
    outage: u32,
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl EventHandler for ChargeOrder {
    fn subject(&self) -> &str {
        "OrderCreated"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), ProcessingError> {
        let order: OrderCreated = serde_json::from_value(envelope.payload.clone())?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.outage {
            return Err(ProcessingError::transient(format!(
                "payment gateway unavailable (call {call})"
            )));
        }
        for line in &order.list {
            log::info!("Charged {} for order {}", order.total, line.id);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let transport = Arc::new(InMemoryTransport::new());
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let dead_letters = InMemoryDeadLetterStore::new();
    let metrics = Arc::new(InMemoryMetrics::new());

    let config = ListenerConfig {
        immediate_retries: 0,
        max_retries: 3,
        lock_timeout: Duration::from_secs(1),
        ack_wait: Duration::from_secs(2),
        dead_letter_initial_delay: Duration::from_secs(1),
        service: "billing".to_string(),
        ..ListenerConfig::default()
    };
    let listener = ListenerCore::new(kv, Arc::new(dead_letters.clone()), config)?
        .with_process_id(ProcessId::new("billing-1"))
        .with_tracer(Arc::new(LogTracer))
        .with_metrics(metrics.clone());

    let handler = Arc::new(ChargeOrder {
        outage: 3,
        calls: AtomicU32::new(0),
    });
    let subscription = listener.subscribe(transport.clone(), handler.clone()).await?;

    let reconciler = DeadLetterReconciler::new(
        Arc::new(dead_letters.clone()),
        transport.clone(),
        ReconcilerConfig {
            poll_interval: Duration::from_millis(500),
            ..ReconcilerConfig::default()
        },
    )?;
    reconciler.start().await;

    transport
        .publish(
            "OrderCreated",
            &serde_json::json!({"list": [{"entity": "order", "id": "abc123"}], "total": 42}),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(10)).await;

    reconciler.shutdown().await;
    subscription.shutdown().await?;

    for record in dead_letters.list(None, 10, 0).await? {
        log::info!(
            "Dead letter {} for '{}': {} after {} attempts",
            record.id,
            record.event_id,
            record.status,
            record.retry_count
        );
    }
    println!(
        "calls: {}, successes: {}, retries: {}, dead letters: {}",
        handler.calls.load(Ordering::SeqCst),
        metrics.successes(),
        metrics.retries(),
        metrics.dead_letters()
    );
    Ok(())
}
