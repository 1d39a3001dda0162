//! Exponential backoff schedules.
//!
//! Three schedules share the same doubling rule:
//!
//! - in-process immediate retries (`100ms`, `200ms`, `400ms`, ...),
//! - the retry-counter expiry window,
//! - the reconciler's republish delay (`2^(retry_count + 1)` minutes).

use chrono::TimeDelta;
use std::time::Duration;

/// Computes `base * 2^exponent`, capped at `max`.
///
/// The exponent is clamped at 63 so `2^exponent` cannot overflow `u64`, and the
/// multiplication saturates instead of wrapping.
pub fn exponential(base: Duration, exponent: u32, max: Duration) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;

    let capped_exponent = exponent.min(63);
    let multiplier = 2u64.saturating_pow(capped_exponent);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}

/// Delay before the `attempt`-th immediate retry (0-indexed).
pub fn immediate_retry_delay(base: Duration, attempt: u32) -> Duration {
    exponential(base, attempt, Duration::from_secs(60))
}

/// Expiry applied to a retry counter after it reaches `attempts`.
///
/// The first failure keeps the counter for `base`, every further failure
/// doubles the window, so abandoned counters clean themselves up.
pub fn retry_counter_ttl(base: Duration, max: Duration, attempts: u32) -> Duration {
    exponential(base, attempts.saturating_sub(1), max)
}

/// Delay before a dead letter is offered to the reconciler again, given the
/// retry count *before* the failed attempt.
pub fn reconcile_retry_delay(previous_retry_count: u32) -> TimeDelta {
    let exponent = previous_retry_count.saturating_add(1).min(20);
    TimeDelta::minutes(1i64 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_retry_delays_double() {
        let base = Duration::from_millis(100);

        assert_eq!(immediate_retry_delay(base, 0), Duration::from_millis(100));
        assert_eq!(immediate_retry_delay(base, 1), Duration::from_millis(200));
        assert_eq!(immediate_retry_delay(base, 2), Duration::from_millis(400));
    }

    #[test]
    fn exponential_handles_large_exponents() {
        let delay = exponential(Duration::from_secs(1), 100, Duration::from_secs(60));
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn retry_counter_ttl_grows_with_attempts() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(86_400);

        assert_eq!(retry_counter_ttl(base, max, 1), Duration::from_secs(60));
        assert_eq!(retry_counter_ttl(base, max, 2), Duration::from_secs(120));
        assert_eq!(retry_counter_ttl(base, max, 3), Duration::from_secs(240));
        assert_eq!(retry_counter_ttl(base, max, 40), max);
    }

    #[test]
    fn reconcile_delay_follows_two_four_eight_minutes() {
        assert_eq!(reconcile_retry_delay(0), TimeDelta::minutes(2));
        assert_eq!(reconcile_retry_delay(1), TimeDelta::minutes(4));
        assert_eq!(reconcile_retry_delay(2), TimeDelta::minutes(8));
    }

    #[test]
    fn reconcile_delay_is_bounded() {
        assert_eq!(reconcile_retry_delay(u32::MAX), TimeDelta::minutes(1 << 20));
    }
}
