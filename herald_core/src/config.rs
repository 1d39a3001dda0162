//! Configuration types for the listener, retry counter and reconciler.

use std::time::Duration;
use uuid::Uuid;

/// Errors returned by `validate()` on the configuration types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The transport could redeliver while a legitimate lock holder is still working.
    #[error("ack_wait ({ack_wait:?}) must be greater than lock_timeout ({lock_timeout:?})")]
    AckWaitTooShort {
        /// Configured acknowledgement timeout.
        ack_wait: Duration,
        /// Configured lock timeout.
        lock_timeout: Duration,
    },
    /// A lock needs at least one second of expiry.
    #[error("lock_timeout must be at least one second, got {0:?}")]
    LockTimeoutTooShort(Duration),
    /// A counter must allow at least one attempt.
    #[error("{0} must be greater than zero")]
    ZeroRetries(&'static str),
    /// A timer interval of zero would spin.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    /// A retry counter could expire before the next redelivery increments it.
    #[error("retry counter base_ttl ({base_ttl:?}) must be at least twice ack_wait ({ack_wait:?})")]
    RetryWindowTooShort {
        /// Configured counter expiry after the first failure.
        base_ttl: Duration,
        /// Configured acknowledgement timeout.
        ack_wait: Duration,
    },
}

/// Configuration for [`ListenerCore`](crate::listener::ListenerCore).
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// In-process retries attempted before falling back to redelivery.
    pub immediate_retries: u32,

    /// Base delay for in-process retries. Doubles with every attempt.
    pub immediate_retry_base_delay: Duration,

    /// Failed deliveries tolerated before the event is dead-lettered.
    pub max_retries: u32,

    /// `max_retries` stamped on dead letters, bounding reconciler attempts.
    pub dead_letter_max_retries: u32,

    /// Expiry of the per-event processing lock. This is the only cancellation
    /// mechanism for locks held by a crashed replica.
    pub lock_timeout: Duration,

    /// Transport acknowledgement timeout. Must exceed `lock_timeout`, otherwise
    /// the transport could redeliver while the lock holder is still working.
    pub ack_wait: Duration,

    /// Serialize processing of the same event across replicas.
    pub enable_lock: bool,

    /// Persist events that exhausted their retries.
    pub enable_dead_letter: bool,

    /// Queue group used when subscribing, so replicas share deliveries.
    pub queue_group: Option<String>,

    /// Service name stamped on dead letters.
    pub service: String,

    /// Pause before giving up on a lock that vanished between `SET NX` and `TTL`.
    pub lock_race_delay: Duration,

    /// A held lock with less remaining time than this is waited for instead of
    /// being treated as actively processed by another replica.
    pub lock_expiring_threshold: Duration,

    /// Added to the remaining lock TTL before re-attempting acquisition.
    pub lock_expiry_buffer: Duration,

    /// Delay before the reconciler may pick up a fresh dead letter.
    pub dead_letter_initial_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            immediate_retries: 3,
            immediate_retry_base_delay: Duration::from_millis(100),
            max_retries: 5,
            dead_letter_max_retries: 5,
            lock_timeout: Duration::from_secs(30),
            ack_wait: Duration::from_secs(60),
            enable_lock: true,
            enable_dead_letter: true,
            queue_group: None,
            service: "herald".to_string(),
            lock_race_delay: Duration::from_millis(100),
            lock_expiring_threshold: Duration::from_secs(10),
            lock_expiry_buffer: Duration::from_millis(500),
            dead_letter_initial_delay: Duration::from_secs(60),
        }
    }
}

impl ListenerConfig {
    /// Checks the invariants between options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries("max_retries"));
        }
        if self.enable_dead_letter && self.dead_letter_max_retries == 0 {
            return Err(ConfigError::ZeroRetries("dead_letter_max_retries"));
        }
        if self.enable_lock {
            if self.lock_timeout < Duration::from_secs(1) {
                return Err(ConfigError::LockTimeoutTooShort(self.lock_timeout));
            }
            if self.ack_wait <= self.lock_timeout {
                return Err(ConfigError::AckWaitTooShort {
                    ack_wait: self.ack_wait,
                    lock_timeout: self.lock_timeout,
                });
            }
        }
        Ok(())
    }

    /// Counter settings whose first window spans two redeliveries.
    pub fn retry_counter_config(&self) -> RetryCounterConfig {
        RetryCounterConfig::for_ack_wait(self.ack_wait)
    }
}

/// Configuration for [`RetryCounter`](crate::retry_counter::RetryCounter).
#[derive(Debug, Clone)]
pub struct RetryCounterConfig {
    /// Expiry after the first failure. Doubles with every further failure.
    pub base_ttl: Duration,
    /// Upper bound for the counter expiry.
    pub max_ttl: Duration,
}

impl Default for RetryCounterConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetryCounterConfig {
    /// Default settings, with `base_ttl` raised to `2 * ack_wait` when that is
    /// longer.
    pub fn for_ack_wait(ack_wait: Duration) -> Self {
        let defaults = Self::default();
        let base_ttl = defaults.base_ttl.max(ack_wait.saturating_mul(2));
        Self {
            base_ttl,
            max_ttl: defaults.max_ttl.max(base_ttl),
        }
    }

    /// Checks that a counter outlives the gap between two deliveries of the
    /// same message.
    pub fn validate(&self, ack_wait: Duration) -> Result<(), ConfigError> {
        if self.base_ttl < ack_wait.saturating_mul(2) || self.max_ttl < self.base_ttl {
            return Err(ConfigError::RetryWindowTooShort {
                base_ttl: self.base_ttl,
                ack_wait,
            });
        }
        Ok(())
    }
}

/// Configuration for [`DeadLetterReconciler`](crate::reconciler::DeadLetterReconciler).
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval of the primary claim-and-republish loop.
    pub poll_interval: Duration,
    /// A record left in `processing` longer than this is considered abandoned.
    pub stuck_timeout: Duration,
    /// Interval of the bulk stuck-recovery loop.
    pub stuck_recovery_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(10 * 60),
            stuck_recovery_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl ReconcilerConfig {
    /// Checks that no timer is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("poll_interval"));
        }
        if self.stuck_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("stuck_timeout"));
        }
        if self.stuck_recovery_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("stuck_recovery_interval"));
        }
        Ok(())
    }
}

/// Identity of this process, used as lock owner token and dead-letter
/// `processor_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(String);

impl ProcessId {
    /// Environment variables consulted by [`ProcessId::from_env`], in order.
    pub const ENV_VARS: [&'static str; 2] = ["POD_NAME", "HOSTNAME"];

    /// Creates a process id from an explicit value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Reads the pod/host name from the environment, falling back to a random id.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        for key in Self::ENV_VARS {
            if let Some(value) = lookup(key)
                && !value.trim().is_empty()
            {
                return Self(value.trim().to_string());
            }
        }
        let id = Self::random();
        log::warn!(
            "None of {:?} is set, using random process id '{}'",
            Self::ENV_VARS,
            id
        );
        id
    }

    /// A random process id of the form `worker-<uuid>`.
    pub fn random() -> Self {
        Self(format!("worker-{}", Uuid::new_v4().simple()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ListenerConfig::default();
        assert_eq!(config.immediate_retries, 3);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.dead_letter_max_retries, 5);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.ack_wait, Duration::from_secs(60));
        assert!(config.enable_lock);
        assert!(config.enable_dead_letter);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ack_wait_must_exceed_lock_timeout() {
        let config = ListenerConfig {
            lock_timeout: Duration::from_secs(60),
            ack_wait: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::AckWaitTooShort {
                ack_wait: Duration::from_secs(60),
                lock_timeout: Duration::from_secs(60),
            })
        );
    }

    #[test]
    fn ack_wait_is_not_checked_without_locking() {
        let config = ListenerConfig {
            enable_lock: false,
            lock_timeout: Duration::from_secs(60),
            ack_wait: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_max_retries_is_rejected() {
        let config = ListenerConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroRetries("max_retries"))
        );
    }

    #[test]
    fn counter_window_spans_two_redeliveries() {
        let config = ListenerConfig::default().retry_counter_config();
        assert_eq!(config.base_ttl, Duration::from_secs(120));
        assert!(config.validate(Duration::from_secs(60)).is_ok());

        let short_ack = RetryCounterConfig::for_ack_wait(Duration::from_secs(5));
        assert_eq!(short_ack.base_ttl, Duration::from_secs(60));
    }

    #[test]
    fn counter_windows_equal_to_ack_wait_are_rejected() {
        let config = RetryCounterConfig {
            base_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(
            config.validate(Duration::from_secs(60)),
            Err(ConfigError::RetryWindowTooShort {
                base_ttl: Duration::from_secs(60),
                ack_wait: Duration::from_secs(60),
            })
        );
    }

    #[test]
    fn reconciler_rejects_zero_intervals() {
        let config = ReconcilerConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("poll_interval"))
        );
    }

    #[test]
    fn process_id_prefers_pod_name() {
        let id = ProcessId::from_lookup(|key| match key {
            "POD_NAME" => Some("orders-7f9c".to_string()),
            "HOSTNAME" => Some("node-1".to_string()),
            _ => None,
        });
        assert_eq!(id.as_str(), "orders-7f9c");
    }

    #[test]
    fn process_id_skips_blank_values() {
        let id = ProcessId::from_lookup(|key| match key {
            "POD_NAME" => Some("  ".to_string()),
            "HOSTNAME" => Some("node-1".to_string()),
            _ => None,
        });
        assert_eq!(id.as_str(), "node-1");
    }

    #[test]
    fn process_id_falls_back_to_random() {
        let a = ProcessId::from_lookup(|_| None);
        let b = ProcessId::from_lookup(|_| None);
        assert!(a.as_str().starts_with("worker-"));
        assert_ne!(a, b);
    }
}
