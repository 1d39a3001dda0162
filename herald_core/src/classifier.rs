//! Failure classification.
//!
//! Errors produced by herald's own adapters are typed at their origin (see
//! [`ProcessingError`](crate::error::ProcessingError)). Errors coming from
//! third-party code are normalized into an [`ErrorDescriptor`] and run through
//! the heuristic in [`classify`], evaluated in a fixed precedence order:
//!
//! 1. status `2xx` is not an error and is never retried,
//! 2. status `5xx` or `429` is transient,
//! 3. network, timeout or unavailability wording is transient,
//! 4. any other `4xx` is permanent,
//! 5. validation, auth or malformed-payload wording is permanent,
//! 6. storage-driver network/timeout error names are transient,
//! 7. duplicate-key storage errors are permanent,
//! 8. programming errors (type, reference, syntax, range) are permanent,
//! 9. everything else is permanent.
//!
//! Unknown errors default to permanent so that a bug cannot turn into an
//! infinite retry storm.

use serde::{Deserialize, Serialize};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// The same input may succeed later (network, timeouts, overload).
    Transient,
    /// Retrying cannot help (bad input, auth, bugs, unknown).
    Permanent,
}

impl FailureClass {
    /// Returns `true` for [`FailureClass::Transient`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

/// Normalized view of an error whose type is not known to herald.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Human readable error message.
    pub message: String,
    /// Numeric status (HTTP-like), when the error carries one.
    pub status: Option<u16>,
    /// Error kind or type name (e.g. `MongoNetworkError`, `TypeError`).
    pub name: Option<String>,
    /// Driver specific code (e.g. `11000`, `23505`).
    pub code: Option<String>,
}

impl ErrorDescriptor {
    /// Creates a descriptor with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Sets the numeric status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the error name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the driver code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Builds a descriptor from any error, using its `Display` output as the
    /// message.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(err.to_string())
    }
}

impl std::fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name, self.status) {
            (Some(name), Some(status)) => write!(f, "{name} ({status}): {}", self.message),
            (Some(name), None) => write!(f, "{name}: {}", self.message),
            (None, Some(status)) => write!(f, "({status}) {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

const TRANSIENT_MESSAGE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "etimedout",
    "econnrefused",
    "econnreset",
    "econnaborted",
    "enotfound",
    "ehostunreach",
    "enetunreach",
    "epipe",
    "eai_again",
    "socket hang up",
    "network",
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "unavailable",
    "too many requests",
    "rate limit",
    "try again",
];

const PERMANENT_MESSAGE_PATTERNS: &[&str] = &[
    "validation",
    "invalid",
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "authentication",
    "permission denied",
    "access denied",
    "malformed",
    "bad request",
    "unexpected token",
    "cannot parse",
    "parse error",
    "schema",
    "required field",
];

const TRANSIENT_DRIVER_NAMES: &[&str] = &[
    "networkerror",
    "networktimeouterror",
    "timeouterror",
    "serverselectionerror",
    "pooltimedout",
    "pooltimeout",
    "poolclosed",
    "connectionerror",
    "ioerror",
];

const PROGRAMMING_ERROR_NAMES: &[&str] =
    &["typeerror", "referenceerror", "syntaxerror", "rangeerror"];

const DUPLICATE_KEY_CODES: &[&str] = &["11000", "11001", "23505"];

const DUPLICATE_KEY_PATTERNS: &[&str] = &[
    "duplicate key",
    "e11000",
    "duplicate entry",
    "unique constraint",
    "unique violation",
    "violates unique",
];

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

fn name_matches(name: Option<&str>, names: &[&str]) -> bool {
    match name {
        Some(name) => {
            let name = name.to_lowercase();
            names.iter().any(|n| name.ends_with(n))
        }
        None => false,
    }
}

/// Returns `true` when the error is a duplicate-key / unique-constraint
/// violation reported by a storage layer.
pub fn is_duplicate_key(error: &ErrorDescriptor) -> bool {
    if let Some(code) = error.code.as_deref()
        && DUPLICATE_KEY_CODES.contains(&code)
    {
        return true;
    }
    if name_matches(error.name.as_deref(), &["duplicatekey", "duplicatekeyerror"]) {
        return true;
    }
    contains_any(&error.message.to_lowercase(), DUPLICATE_KEY_PATTERNS)
}

/// Classifies an error as transient or permanent.
pub fn classify(error: &ErrorDescriptor) -> FailureClass {
    let message = error.message.to_lowercase();
    let name = error.name.as_deref();

    if let Some(status) = error.status {
        if (200..300).contains(&status) {
            log::warn!("Classifying a {status} status as a failure, it will not be retried");
            return FailureClass::Permanent;
        }
        if (500..600).contains(&status) || status == 429 {
            return FailureClass::Transient;
        }
    }

    if contains_any(&message, TRANSIENT_MESSAGE_PATTERNS) {
        return FailureClass::Transient;
    }

    if let Some(status) = error.status
        && (400..500).contains(&status)
    {
        return FailureClass::Permanent;
    }

    if contains_any(&message, PERMANENT_MESSAGE_PATTERNS) {
        return FailureClass::Permanent;
    }

    if name_matches(name, TRANSIENT_DRIVER_NAMES) {
        return FailureClass::Transient;
    }

    if is_duplicate_key(error) {
        return FailureClass::Permanent;
    }

    if name_matches(name, PROGRAMMING_ERROR_NAMES) {
        return FailureClass::Permanent;
    }

    FailureClass::Permanent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_is_not_retried() {
        let err = ErrorDescriptor::new("request timed out").with_status(204);
        assert_eq!(classify(&err), FailureClass::Permanent);
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [500, 502, 503, 599, 429] {
            let err = ErrorDescriptor::new("upstream said no").with_status(status);
            assert_eq!(classify(&err), FailureClass::Transient, "status {status}");
        }
    }

    #[test]
    fn network_wording_is_transient() {
        for message in [
            "connect ECONNREFUSED 10.0.0.1:6379",
            "Operation Timed Out",
            "socket hang up",
            "Service Unavailable",
        ] {
            assert_eq!(
                classify(&ErrorDescriptor::new(message)),
                FailureClass::Transient,
                "{message}"
            );
        }
    }

    #[test]
    fn network_wording_wins_over_client_status() {
        let err = ErrorDescriptor::new("gateway timeout while proxying").with_status(408);
        assert_eq!(classify(&err), FailureClass::Transient);
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 422] {
            let err = ErrorDescriptor::new("nope").with_status(status);
            assert_eq!(classify(&err), FailureClass::Permanent, "status {status}");
        }
    }

    #[test]
    fn validation_wording_is_permanent() {
        for message in ["Validation failed: name", "Invalid payload", "Unauthorized"] {
            assert_eq!(
                classify(&ErrorDescriptor::new(message)),
                FailureClass::Permanent
            );
        }
    }

    #[test]
    fn driver_network_names_are_transient() {
        let err = ErrorDescriptor::new("server selection failed").with_name("MongoNetworkError");
        assert_eq!(classify(&err), FailureClass::Transient);

        let err = ErrorDescriptor::new("pool exhausted").with_name("PoolTimedOut");
        assert_eq!(classify(&err), FailureClass::Transient);
    }

    #[test]
    fn duplicate_keys_are_detected_by_code_name_or_message() {
        assert!(is_duplicate_key(
            &ErrorDescriptor::new("write failed").with_code("11000")
        ));
        assert!(is_duplicate_key(
            &ErrorDescriptor::new("write failed").with_name("DuplicateKeyError")
        ));
        assert!(is_duplicate_key(&ErrorDescriptor::new(
            "duplicate key value violates unique constraint \"orders_pkey\""
        )));
        assert!(!is_duplicate_key(&ErrorDescriptor::new("disk full")));
    }

    #[test]
    fn duplicate_keys_are_permanent() {
        let err = ErrorDescriptor::new("E11000 duplicate key error collection: orders");
        assert_eq!(classify(&err), FailureClass::Permanent);
    }

    #[test]
    fn programming_errors_are_permanent() {
        let err = ErrorDescriptor::new("cannot read property 'id' of undefined")
            .with_name("TypeError");
        assert_eq!(classify(&err), FailureClass::Permanent);
    }

    #[test]
    fn unknown_errors_default_to_permanent() {
        assert_eq!(
            classify(&ErrorDescriptor::new("something odd happened")),
            FailureClass::Permanent
        );
    }
}
