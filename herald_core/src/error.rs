//! The typed outcome of a failed handler invocation.

use crate::classifier::{self, ErrorDescriptor, FailureClass};
use crate::dead_letter::DeadLetterStoreError;
use crate::kv::StoreError;
use crate::transport::TransportError;

/// Why processing an event failed.
///
/// Adapters that know what went wrong should build one of the typed variants
/// at the point of failure. [`ProcessingError::Unclassified`] is the fallback
/// for third-party errors and is run through the
/// [`classifier`](crate::classifier) heuristic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    /// Retrying the same event may succeed.
    #[error("transient failure: {reason}")]
    Transient {
        /// What went wrong.
        reason: String,
    },
    /// Retrying cannot help.
    #[error("permanent failure: {reason}")]
    Permanent {
        /// What went wrong.
        reason: String,
    },
    /// The side effect already happened (unique constraint violation).
    #[error("duplicate key: {reason}")]
    DuplicateKey {
        /// What went wrong.
        reason: String,
    },
    /// An error herald knows nothing about.
    #[error("{0}")]
    Unclassified(ErrorDescriptor),
}

impl ProcessingError {
    /// Creates a [`ProcessingError::Transient`].
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Creates a [`ProcessingError::Permanent`].
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// Creates a [`ProcessingError::DuplicateKey`].
    pub fn duplicate_key(reason: impl Into<String>) -> Self {
        Self::DuplicateKey {
            reason: reason.into(),
        }
    }

    /// Wraps a third-party error for heuristic classification.
    pub fn unclassified(descriptor: ErrorDescriptor) -> Self {
        Self::Unclassified(descriptor)
    }

    /// Wraps any error by message for heuristic classification.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::Unclassified(ErrorDescriptor::from_error(err))
    }

    /// Whether this is a duplicate-key violation, typed or detected.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Self::DuplicateKey { .. } => true,
            Self::Unclassified(descriptor) => classifier::is_duplicate_key(descriptor),
            _ => false,
        }
    }

    /// Retry class of this failure.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Transient { .. } => FailureClass::Transient,
            Self::Permanent { .. } | Self::DuplicateKey { .. } => FailureClass::Permanent,
            Self::Unclassified(descriptor) => classifier::classify(descriptor),
        }
    }
}

impl From<StoreError> for ProcessingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection(_) | StoreError::Timeout(_) => Self::transient(err.to_string()),
            StoreError::DuplicateKey(_) => Self::duplicate_key(err.to_string()),
            StoreError::Command(_) => Self::permanent(err.to_string()),
        }
    }
}

impl From<DeadLetterStoreError> for ProcessingError {
    fn from(err: DeadLetterStoreError) -> Self {
        match err {
            DeadLetterStoreError::Unavailable(_) => Self::transient(err.to_string()),
            DeadLetterStoreError::DuplicateKey(_) => Self::duplicate_key(err.to_string()),
            DeadLetterStoreError::Database(_) => {
                Self::Unclassified(ErrorDescriptor::new(err.to_string()))
            }
            DeadLetterStoreError::Serialization(_) => Self::permanent(err.to_string()),
        }
    }
}

impl From<TransportError> for ProcessingError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::Unavailable(_) => {
                Self::transient(err.to_string())
            }
            TransportError::Rejected(_) => Self::permanent(err.to_string()),
        }
    }
}

impl From<ErrorDescriptor> for ProcessingError {
    fn from(descriptor: ErrorDescriptor) -> Self {
        Self::Unclassified(descriptor)
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("malformed payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_variants_classify_directly() {
        assert_eq!(
            ProcessingError::transient("flaky").class(),
            FailureClass::Transient
        );
        assert_eq!(
            ProcessingError::permanent("timeout in message but typed permanent").class(),
            FailureClass::Permanent
        );
        assert_eq!(
            ProcessingError::duplicate_key("orders_pkey").class(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn unclassified_errors_use_the_heuristic() {
        let err = ProcessingError::unclassified(ErrorDescriptor::new("read ETIMEDOUT"));
        assert_eq!(err.class(), FailureClass::Transient);

        let err = ProcessingError::unclassified(
            ErrorDescriptor::new("E11000 duplicate key error").with_code("11000"),
        );
        assert!(err.is_duplicate_key());
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[test]
    fn store_errors_are_typed_at_the_origin() {
        assert_eq!(
            ProcessingError::from(StoreError::Timeout("GET".into())).class(),
            FailureClass::Transient
        );
        assert!(ProcessingError::from(StoreError::DuplicateKey("k".into())).is_duplicate_key());
        assert_eq!(
            ProcessingError::from(StoreError::Command("WRONGTYPE".into())).class(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn malformed_json_is_permanent() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert_eq!(ProcessingError::from(err).class(), FailureClass::Permanent);
    }
}
