//! Shape validation for mutations entering the queue.
//!
//! Validation is pure: it never panics and never touches its input. Every
//! violated constraint contributes its own message.

use serde::Serialize;
use serde_json::Value;
use uuid::{Uuid, Variant};

use jobsync_common::{parse_timestamp, EntityType, MutationAction};

use crate::queue::NewQueueItem;

/// Ceiling on the serialized size of a mutation payload.
pub const MAX_DATA_BYTES: usize = 500 * 1024;

/// Outcome of validating one candidate queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn is_uuid_v4(s: &str) -> bool {
    s.len() == 36
        && Uuid::parse_str(s)
            .map(|u| u.get_version_num() == 4 && u.get_variant() == Variant::RFC4122)
            .unwrap_or(false)
}

fn check_entity_type(candidate: &serde_json::Map<String, Value>, errors: &mut Vec<String>) {
    match present(candidate.get("entity_type")) {
        None => errors.push("entity_type is required".to_string()),
        Some(v) => {
            let known = v.as_str().map(|s| s.parse::<EntityType>().is_ok()).unwrap_or(false);
            if !known {
                errors.push("entity_type must be one of: job, quote, invoice, client".to_string());
            }
        }
    }
}

fn check_entity_id(candidate: &serde_json::Map<String, Value>, errors: &mut Vec<String>) {
    match present(candidate.get("entity_id")) {
        None => errors.push("entity_id is required".to_string()),
        Some(Value::String(id)) if id.trim().is_empty() => {
            errors.push("entity_id must not be empty".to_string())
        }
        Some(Value::String(id)) if !is_uuid_v4(id) => {
            errors.push("entity_id must be a valid UUID v4".to_string())
        }
        Some(Value::String(_)) => {}
        Some(_) => errors.push("entity_id must be a string".to_string()),
    }
}

fn check_action(candidate: &serde_json::Map<String, Value>, errors: &mut Vec<String>) {
    match present(candidate.get("action")) {
        None => errors.push("action is required".to_string()),
        Some(v) => {
            let known = v
                .as_str()
                .map(|s| s.parse::<MutationAction>().is_ok())
                .unwrap_or(false);
            if !known {
                errors.push("action must be one of: create, update, delete".to_string());
            }
        }
    }
}

fn check_data(candidate: &serde_json::Map<String, Value>, errors: &mut Vec<String>) {
    match candidate.get("data") {
        None => errors.push("data is required".to_string()),
        Some(Value::Null) => errors.push("data must not be null".to_string()),
        Some(Value::Array(_)) => errors.push("data must be an object, not an array".to_string()),
        Some(data @ Value::Object(_)) => match serde_json::to_vec(data) {
            Ok(bytes) if bytes.len() > MAX_DATA_BYTES => errors.push(format!(
                "data exceeds maximum size of {}KB ({} bytes)",
                MAX_DATA_BYTES / 1024,
                bytes.len()
            )),
            Ok(_) => {}
            Err(e) => errors.push(format!("data must be serializable to JSON: {}", e)),
        },
        Some(_) => errors.push("data must be an object".to_string()),
    }
}

fn check_optional_fields(candidate: &serde_json::Map<String, Value>, errors: &mut Vec<String>) {
    if let Some(count) = present(candidate.get("retry_count")) {
        if !count.is_u64() {
            errors.push("retry_count must be a non-negative integer".to_string());
        }
    }

    if let Some(created_at) = present(candidate.get("created_at")) {
        let valid = match created_at {
            Value::String(s) => parse_timestamp(s).is_some(),
            Value::Number(n) => n.is_i64() || n.is_u64(),
            _ => false,
        };
        if !valid {
            errors.push("created_at must be a valid timestamp".to_string());
        }
    }
}

/// Validate a raw candidate queue item, which may be partial or mistyped.
pub fn validate_queue_item(candidate: &Value) -> ValidationResult {
    let Some(candidate) = candidate.as_object() else {
        return ValidationResult::from_errors(vec!["queue item must be an object".to_string()]);
    };

    let mut errors = Vec::new();
    check_entity_type(candidate, &mut errors);
    check_entity_id(candidate, &mut errors);
    check_action(candidate, &mut errors);
    check_data(candidate, &mut errors);
    check_optional_fields(candidate, &mut errors);

    ValidationResult::from_errors(errors)
}

/// Validate a typed queue item before insertion.
pub fn validate_new_item(item: &NewQueueItem) -> ValidationResult {
    match serde_json::to_value(item) {
        Ok(value) => validate_queue_item(&value),
        Err(e) => ValidationResult::from_errors(vec![format!(
            "data must be serializable to JSON: {}",
            e
        )]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const VALID_ID: &str = "3f2b8c1e-9a4d-4e6f-8b2a-1c3d5e7f9a0b";

    fn valid_item() -> Value {
        json!({
            "entity_type": "invoice",
            "entity_id": VALID_ID,
            "action": "update",
            "data": {"status": "paid"},
            "created_at": "2026-02-13T10:00:00Z",
            "retry_count": 0,
        })
    }

    fn errors_for(mutate: impl FnOnce(&mut serde_json::Map<String, Value>)) -> Vec<String> {
        let mut item = valid_item();
        mutate(item.as_object_mut().unwrap());
        let result = validate_queue_item(&item);
        assert!(!result.valid);
        result.errors
    }

    #[test]
    fn test_valid_item_passes() {
        let result = validate_queue_item(&valid_item());
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_bad_uuid() {
        let errors = errors_for(|m| {
            m.insert("entity_id".into(), json!("not-a-uuid"));
        });
        assert_eq!(errors, vec!["entity_id must be a valid UUID v4"]);

        // v1 UUIDs are rejected as well.
        let errors = errors_for(|m| {
            m.insert("entity_id".into(), json!("6fa459ea-ee8a-11ca-8b2a-1c3d5e7f9a0b"));
        });
        assert_eq!(errors, vec!["entity_id must be a valid UUID v4"]);
    }

    #[test]
    fn test_entity_id_type_and_presence() {
        assert_eq!(
            errors_for(|m| {
                m.remove("entity_id");
            }),
            vec!["entity_id is required"]
        );
        assert_eq!(
            errors_for(|m| {
                m.insert("entity_id".into(), json!(42));
            }),
            vec!["entity_id must be a string"]
        );
        assert_eq!(
            errors_for(|m| {
                m.insert("entity_id".into(), json!("  "));
            }),
            vec!["entity_id must not be empty"]
        );
    }

    #[test]
    fn test_wrong_action_and_entity_type() {
        assert_eq!(
            errors_for(|m| {
                m.insert("action".into(), json!("upsert"));
            }),
            vec!["action must be one of: create, update, delete"]
        );
        assert_eq!(
            errors_for(|m| {
                m.insert("entity_type".into(), json!("customer"));
            }),
            vec!["entity_type must be one of: job, quote, invoice, client"]
        );
        assert_eq!(
            errors_for(|m| {
                m.remove("action");
            }),
            vec!["action is required"]
        );
    }

    #[test]
    fn test_data_shape() {
        assert_eq!(
            errors_for(|m| {
                m.insert("data".into(), json!([1, 2, 3]));
            }),
            vec!["data must be an object, not an array"]
        );
        assert_eq!(
            errors_for(|m| {
                m.insert("data".into(), Value::Null);
            }),
            vec!["data must not be null"]
        );
        assert_eq!(
            errors_for(|m| {
                m.insert("data".into(), json!("text"));
            }),
            vec!["data must be an object"]
        );
        assert_eq!(
            errors_for(|m| {
                m.remove("data");
            }),
            vec!["data is required"]
        );
    }

    #[test]
    fn test_oversized_payload() {
        let errors = errors_for(|m| {
            m.insert("data".into(), json!({"notes": "x".repeat(600 * 1024)}));
        });
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("data exceeds maximum size of 500KB"));
    }

    #[test]
    fn test_optional_fields() {
        assert_eq!(
            errors_for(|m| {
                m.insert("retry_count".into(), json!(-1));
            }),
            vec!["retry_count must be a non-negative integer"]
        );
        assert_eq!(
            errors_for(|m| {
                m.insert("created_at".into(), json!("yesterday"));
            }),
            vec!["created_at must be a valid timestamp"]
        );

        let mut item = valid_item();
        let m = item.as_object_mut().unwrap();
        m.remove("retry_count");
        m.remove("created_at");
        assert!(validate_queue_item(&item).valid);
    }

    #[test]
    fn test_collects_every_error_without_mutating() {
        let item = json!({"data": []});
        let before = item.clone();
        let result = validate_queue_item(&item);

        assert_eq!(result.errors.len(), 4);
        assert_eq!(item, before);
        assert_eq!(
            validate_queue_item(&json!([])).errors,
            vec!["queue item must be an object"]
        );
    }

    #[test]
    fn test_validate_new_item() {
        let item = NewQueueItem::new(
            EntityType::Client,
            uuid::Uuid::new_v4().to_string(),
            MutationAction::Create,
            json!({"name": "Jane"}),
        );
        assert!(validate_new_item(&item).valid);

        let bad = NewQueueItem::new(EntityType::Client, "", MutationAction::Create, json!([]));
        assert_eq!(validate_new_item(&bad).errors.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_well_formed_items_pass(
            entity in prop::sample::select(EntityType::ALL.to_vec()),
            action in prop::sample::select(MutationAction::ALL.to_vec()),
            key in "[a-z_]{1,12}",
            value in ".{0,64}",
        ) {
            let mut data = serde_json::Map::new();
            data.insert(key, Value::String(value));
            let item = json!({
                "entity_type": entity.as_str(),
                "entity_id": uuid::Uuid::new_v4().to_string(),
                "action": action.as_str(),
                "data": data,
            });
            let result = validate_queue_item(&item);
            prop_assert!(result.valid, "{:?}", result.errors);
        }
    }
}
