//! Wall-clock source for timestamps written to the dead-letter store.

use chrono::{DateTime, Utc};

/// Provides the current wall-clock time.
///
/// Every timestamp herald persists (`next_retry_at`, `processing_started_at`,
/// `completed_at`) and every stuck cut-off is taken from a `Clock`, so that
/// schedules can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
