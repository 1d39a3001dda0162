//! Deriving a stable event identity from a payload.
//!
//! The identity keys the processing lock, the retry counter and the dead
//! letter, so it must be the same on every redelivery of the same event.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derives the identity of an event from its subject and payload.
pub trait EventIdentity: Send + Sync {
    /// Returns the event id, or `None` if the payload doesn't carry one this
    /// rule understands.
    fn event_id(&self, subject: &str, payload: &Value) -> Option<String>;
}

/// `"{entity}-{id}"` taken from the first element of the payload's `list`
/// field, or `"{id}"` when that element has no `entity`.
///
/// `{"list": [{"entity": "order", "id": "abc123"}]}` yields `order-abc123`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListEntityIdentity;

impl EventIdentity for ListEntityIdentity {
    fn event_id(&self, _subject: &str, payload: &Value) -> Option<String> {
        let first = payload.get("list")?.as_array()?.first()?;
        let id = scalar_to_string(first.get("id")?)?;
        match first.get("entity").and_then(scalar_to_string) {
            Some(entity) => Some(format!("{entity}-{id}")),
            None => Some(id),
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `"{subject}-{digest}"` where `digest` is the first 16 hex characters of the
/// SHA-256 of the serialized payload.
///
/// Content addressed and therefore stable across redeliveries, at the cost of
/// treating two identical payloads as the same event.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentDigestIdentity;

impl EventIdentity for ContentDigestIdentity {
    fn event_id(&self, subject: &str, payload: &Value) -> Option<String> {
        // serde_json serializes object keys in sorted order, so equal payloads
        // hash equally.
        let bytes = serde_json::to_vec(payload).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = format!("{:x}", hasher.finalize());
        Some(format!("{subject}-{}", &digest[..16]))
    }
}

/// [`ListEntityIdentity`], falling back to [`ContentDigestIdentity`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIdentity;

impl EventIdentity for DefaultIdentity {
    fn event_id(&self, subject: &str, payload: &Value) -> Option<String> {
        Some(default_event_id(subject, payload))
    }
}

/// Tries [`ListEntityIdentity`] then falls back to [`ContentDigestIdentity`].
pub fn default_event_id(subject: &str, payload: &Value) -> String {
    ListEntityIdentity
        .event_id(subject, payload)
        .or_else(|| ContentDigestIdentity.event_id(subject, payload))
        .unwrap_or_else(|| format!("{subject}-unidentified"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_entity_identity_combines_entity_and_id() {
        let payload = json!({"list": [{"entity": "order", "id": "abc123"}, {"entity": "order", "id": "zzz"}]});
        assert_eq!(
            ListEntityIdentity.event_id("OrderCreated", &payload),
            Some("order-abc123".to_string())
        );
    }

    #[test]
    fn list_entity_identity_accepts_numeric_ids_without_entity() {
        let payload = json!({"list": [{"id": 42}]});
        assert_eq!(
            ListEntityIdentity.event_id("OrderCreated", &payload),
            Some("42".to_string())
        );
    }

    #[test]
    fn list_entity_identity_rejects_missing_shapes() {
        for payload in [
            json!({}),
            json!({"list": []}),
            json!({"list": [{"entity": "order"}]}),
            json!({"list": "order"}),
            json!({"list": [{"id": ""}]}),
        ] {
            assert_eq!(ListEntityIdentity.event_id("S", &payload), None, "{payload}");
        }
    }

    #[test]
    fn content_digest_is_stable_across_redeliveries() {
        let a = json!({"b": 1, "a": [1, 2, 3]});
        let b = json!({"a": [1, 2, 3], "b": 1});
        let first = ContentDigestIdentity.event_id("Invoice", &a).unwrap();
        let second = ContentDigestIdentity.event_id("Invoice", &b).unwrap();

        assert_eq!(first, second);
        assert!(first.starts_with("Invoice-"));
        assert_eq!(first.len(), "Invoice-".len() + 16);
    }

    #[test]
    fn content_digest_depends_on_subject_and_payload() {
        let payload = json!({"amount": 10});
        assert_ne!(
            ContentDigestIdentity.event_id("A", &payload),
            ContentDigestIdentity.event_id("B", &payload)
        );
        assert_ne!(
            ContentDigestIdentity.event_id("A", &payload),
            ContentDigestIdentity.event_id("A", &json!({"amount": 11}))
        );
    }

    #[test]
    fn default_prefers_the_list_rule() {
        let payload = json!({"list": [{"entity": "order", "id": "abc123"}]});
        assert_eq!(default_event_id("OrderCreated", &payload), "order-abc123");
        assert!(default_event_id("OrderCreated", &json!({"x": 1})).starts_with("OrderCreated-"));
    }
}
