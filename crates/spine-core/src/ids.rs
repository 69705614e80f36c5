//! Identifier and clock helpers
//!
//! All identifiers are UUID v7: lexicographically time-sortable, which keeps
//! `ORDER BY created_at, id` stable and index-friendly.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a new execution identifier.
pub fn new_execution_id() -> Uuid {
    Uuid::now_v7()
}

/// Generate a new event identifier.
pub fn new_event_id() -> Uuid {
    Uuid::now_v7()
}

/// Generate a new workflow-run identifier.
pub fn new_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Current UTC timestamp.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Compute a deterministic hash of a JSON payload.
///
/// Object keys are serialized in sorted order so that two payloads that are
/// equal as maps hash identically regardless of insertion order. Used for
/// spec deduplication and hot-reload change detection.
pub fn spec_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_value(value, &mut hasher);
    hex::encode(hasher.finalize())
}

fn hash_value(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update(b"null"),
        Value::Bool(b) => hasher.update(if *b { b"true" as &[u8] } else { b"false" }),
        Value::Number(n) => hasher.update(n.to_string().as_bytes()),
        Value::String(s) => {
            hasher.update(b"\"");
            hasher.update(s.as_bytes());
            hasher.update(b"\"");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b":");
                hash_value(&map[key], hasher);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_time_ordered() {
        let a = new_execution_id();
        let b = new_execution_id();
        assert!(a < b);
    }

    #[test]
    fn test_spec_hash_key_order_independent() {
        let a = json!({"image": "alpine", "name": "j", "timeout": 60});
        let b = json!({"timeout": 60, "name": "j", "image": "alpine"});
        assert_eq!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn test_spec_hash_differs_on_content() {
        let a = json!({"name": "j1"});
        let b = json!({"name": "j2"});
        assert_ne!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn test_spec_hash_nested() {
        let a = json!({"env": {"B": "2", "A": "1"}});
        let b = json!({"env": {"A": "1", "B": "2"}});
        assert_eq!(spec_hash(&a), spec_hash(&b));
    }
}
