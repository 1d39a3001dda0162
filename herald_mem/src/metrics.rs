use herald_core::prelude::ListenerMetrics;
use std::sync::atomic::{AtomicU64, Ordering};

/// [`ListenerMetrics`] that counts outcomes across all subjects.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    successes: AtomicU64,
    retries: AtomicU64,
    dead_letters: AtomicU64,
    exhausted: AtomicU64,
    skips: AtomicU64,
    duplicates: AtomicU64,
}

impl InMemoryMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler successes.
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::SeqCst)
    }

    /// Failures left for redelivery.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Dead letters written.
    pub fn dead_letters(&self) -> u64 {
        self.dead_letters.load(Ordering::SeqCst)
    }

    /// Exhausted events dropped with dead-lettering disabled.
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Deliveries skipped because another replica held the lock.
    pub fn skips(&self) -> u64 {
        self.skips.load(Ordering::SeqCst)
    }

    /// Duplicate-key failures acked without retry.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::SeqCst)
    }
}

impl ListenerMetrics for InMemoryMetrics {
    fn on_success(&self, _subject: &str) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_retry(&self, _subject: &str, _attempt: u32) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn on_dead_letter(&self, _subject: &str) {
        self.dead_letters.fetch_add(1, Ordering::SeqCst);
    }

    fn on_exhausted(&self, _subject: &str) {
        self.exhausted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_skip(&self, _subject: &str) {
        self.skips.fetch_add(1, Ordering::SeqCst);
    }

    fn on_duplicate(&self, _subject: &str) {
        self.duplicates.fetch_add(1, Ordering::SeqCst);
    }
}
