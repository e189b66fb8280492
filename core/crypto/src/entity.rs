//! Per-entity wrappers applying field encryption to sensitive attributes.
//!
//! Clients carry personal data; invoices and quotes carry monetary totals,
//! which are sealed as their string representation and restored to JSON
//! numbers on the way out. Other non-string values keep their JSON type
//! through a round trip. Jobs have no sensitive fields.

use serde_json::{Number, Value};

use jobsync_common::{EntityType, Record};

use crate::field::FieldCipher;

const CLIENT_FIELDS: &[&str] = &["name", "email", "phone", "address"];
const INVOICE_FIELDS: &[&str] = &["subtotal", "tax_amount", "total", "amount_paid"];
const QUOTE_FIELDS: &[&str] = &["subtotal", "tax_amount", "total"];

/// Minimum base64 length of a sealed value (nonce + tag, no plaintext).
const MIN_SEALED_LEN: usize = 40;

/// Attributes encrypted at rest for an entity kind.
pub fn sensitive_fields(entity: EntityType) -> &'static [&'static str] {
    match entity {
        EntityType::Client => CLIENT_FIELDS,
        EntityType::Invoice => INVOICE_FIELDS,
        EntityType::Quote => QUOTE_FIELDS,
        EntityType::Job => &[],
    }
}

fn is_monetary(entity: EntityType) -> bool {
    matches!(entity, EntityType::Invoice | EntityType::Quote)
}

/// Leads sealed plaintext that holds the JSON text of a non-string value.
const JSON_TAG: char = '\u{1}';

/// Plaintext for a sensitive value, or `None` for null.
///
/// Strings are sealed as-is and monetary numbers as their decimal text.
/// Anything else (objects, arrays, booleans, numbers outside monetary
/// fields, strings that happen to start with the tag) is sealed as tagged
/// JSON so it opens back to the same value.
fn plaintext_for(value: &Value, monetary: bool) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if !s.starts_with(JSON_TAG) => Some(s.clone()),
        Value::Number(n) if monetary => Some(n.to_string()),
        other => Some(format!("{}{}", JSON_TAG, other)),
    }
}

fn seal_value(cipher: &FieldCipher, value: &Value, monetary: bool) -> Value {
    let Some(plaintext) = plaintext_for(value, monetary) else {
        return Value::Null;
    };

    cipher
        .encrypt_field(Some(&plaintext))
        .map(Value::String)
        .unwrap_or(Value::Null)
}

fn open_value(cipher: &FieldCipher, value: &Value, monetary: bool) -> Value {
    let Value::String(sealed) = value else {
        // Numbers and nulls were never sealed.
        return value.clone();
    };

    match cipher.decrypt_field(sealed) {
        Some(plaintext) => match plaintext.strip_prefix(JSON_TAG) {
            Some(json) => serde_json::from_str(json).unwrap_or(Value::Null),
            None if monetary => parse_amount(&plaintext),
            None => Value::String(plaintext),
        },
        None => Value::Null,
    }
}

fn parse_amount(plaintext: &str) -> Value {
    if let Ok(n) = plaintext.parse::<i64>() {
        return Value::Number(n.into());
    }
    plaintext
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(plaintext.to_string()))
}

/// Return a copy of `record` with the entity's sensitive fields sealed.
///
/// Fields absent from the record stay absent; all other fields are copied
/// untouched.
pub fn encrypt_entity_fields(cipher: &FieldCipher, entity: EntityType, record: &Record) -> Record {
    let monetary = is_monetary(entity);
    let mut out = record.clone();
    for field in sensitive_fields(entity) {
        if let Some(value) = record.get(*field) {
            out.insert((*field).to_string(), seal_value(cipher, value, monetary));
        }
    }
    out
}

/// Return a copy of `record` with the entity's sensitive fields opened.
///
/// A field that fails to decrypt becomes `null`.
pub fn decrypt_entity_fields(cipher: &FieldCipher, entity: EntityType, record: &Record) -> Record {
    let monetary = is_monetary(entity);
    let mut out = record.clone();
    for field in sensitive_fields(entity) {
        if let Some(value) = record.get(*field) {
            out.insert((*field).to_string(), open_value(cipher, value, monetary));
        }
    }
    out
}

pub fn encrypt_client_fields(cipher: &FieldCipher, record: &Record) -> Record {
    encrypt_entity_fields(cipher, EntityType::Client, record)
}

pub fn decrypt_client_fields(cipher: &FieldCipher, record: &Record) -> Record {
    decrypt_entity_fields(cipher, EntityType::Client, record)
}

pub fn encrypt_invoice_fields(cipher: &FieldCipher, record: &Record) -> Record {
    encrypt_entity_fields(cipher, EntityType::Invoice, record)
}

pub fn decrypt_invoice_fields(cipher: &FieldCipher, record: &Record) -> Record {
    decrypt_entity_fields(cipher, EntityType::Invoice, record)
}

pub fn encrypt_quote_fields(cipher: &FieldCipher, record: &Record) -> Record {
    encrypt_entity_fields(cipher, EntityType::Quote, record)
}

pub fn decrypt_quote_fields(cipher: &FieldCipher, record: &Record) -> Record {
    decrypt_entity_fields(cipher, EntityType::Quote, record)
}

fn is_base64_only(s: &str) -> bool {
    let body = s.trim_end_matches('=');
    s.len() >= MIN_SEALED_LEN
        && s.len() - body.len() <= 2
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

/// Guess whether a record written without an `encrypted` marker was
/// already sealed.
///
/// Monetary entities are considered sealed when an amount is stored as a
/// string; clients when the name is a long base64-only string. Only used
/// to backfill the marker for legacy rows.
pub fn looks_encrypted(entity: EntityType, record: &Record) -> bool {
    match entity {
        EntityType::Invoice | EntityType::Quote => sensitive_fields(entity)
            .iter()
            .any(|f| matches!(record.get(*f), Some(Value::String(_)))),
        EntityType::Client => record
            .get("name")
            .and_then(Value::as_str)
            .map(is_base64_only)
            .unwrap_or(false),
        EntityType::Job => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MemoryKeyStore;
    use serde_json::json;
    use std::sync::Arc;

    fn cipher() -> FieldCipher {
        FieldCipher::new(Arc::new(MemoryKeyStore::new()))
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_client_fields_roundtrip() {
        let cipher = cipher();
        let client = record(json!({
            "id": "c1",
            "owner_id": "u1",
            "name": "Jane Doe",
            "email": "jane@example.com",
            "phone": "",
            "notes": "prefers mornings"
        }));

        let sealed = encrypt_client_fields(&cipher, &client);
        assert_ne!(sealed["name"], json!("Jane Doe"));
        assert_eq!(sealed["phone"], Value::Null);
        assert_eq!(sealed["notes"], json!("prefers mornings"));
        assert!(!sealed.contains_key("address"));

        let opened = decrypt_client_fields(&cipher, &sealed);
        assert_eq!(opened["name"], json!("Jane Doe"));
        assert_eq!(opened["email"], json!("jane@example.com"));
        assert_eq!(opened["phone"], Value::Null);
        assert_eq!(opened["id"], json!("c1"));
    }

    #[test]
    fn test_invoice_amounts_roundtrip_as_numbers() {
        let cipher = cipher();
        let invoice = record(json!({
            "id": "i1",
            "status": "sent",
            "subtotal": 100,
            "tax_amount": 12.5,
            "total": 112.5
        }));

        let sealed = encrypt_invoice_fields(&cipher, &invoice);
        assert!(sealed["total"].is_string());
        assert_eq!(sealed["status"], json!("sent"));

        let opened = decrypt_invoice_fields(&cipher, &sealed);
        assert_eq!(opened["subtotal"], json!(100));
        assert_eq!(opened["tax_amount"], json!(12.5));
        assert_eq!(opened["total"], json!(112.5));
    }

    #[test]
    fn test_quote_undecryptable_amount_becomes_null() {
        let cipher = cipher();
        let quote = record(json!({"id": "q1", "total": "garbage-ciphertext"}));

        let opened = decrypt_quote_fields(&cipher, &quote);
        assert_eq!(opened["total"], Value::Null);

        let sealed = encrypt_quote_fields(&cipher, &record(json!({"id": "q1", "total": 5})));
        assert_eq!(decrypt_quote_fields(&cipher, &sealed)["total"], json!(5));
    }

    #[test]
    fn test_structured_client_fields_keep_their_type() {
        let cipher = cipher();
        let client = record(json!({
            "id": "c1",
            "name": "\u{1}not json",
            "phone": 5551234,
            "address": {"street": "1 Main", "city": "X"},
            "email": ["a@example.com", "b@example.com"]
        }));

        let sealed = encrypt_client_fields(&cipher, &client);
        for field in CLIENT_FIELDS {
            assert!(sealed[*field].is_string(), "{} not sealed", field);
        }
        assert_eq!(decrypt_client_fields(&cipher, &sealed), client);
    }

    #[test]
    fn test_jobs_pass_through() {
        let cipher = cipher();
        let job = record(json!({"id": "j1", "title": "Fix roof", "total": 10}));

        assert_eq!(encrypt_entity_fields(&cipher, EntityType::Job, &job), job);
        assert_eq!(decrypt_entity_fields(&cipher, EntityType::Job, &job), job);
    }

    #[test]
    fn test_looks_encrypted_heuristic() {
        let cipher = cipher();

        let plain_invoice = record(json!({"total": 12.0}));
        assert!(!looks_encrypted(EntityType::Invoice, &plain_invoice));
        let sealed_invoice = encrypt_invoice_fields(&cipher, &plain_invoice);
        assert!(looks_encrypted(EntityType::Invoice, &sealed_invoice));

        let plain_client = record(json!({"name": "Bob"}));
        assert!(!looks_encrypted(EntityType::Client, &plain_client));
        let sealed_client = encrypt_client_fields(&cipher, &plain_client);
        assert!(looks_encrypted(EntityType::Client, &sealed_client));

        assert!(!looks_encrypted(EntityType::Job, &plain_client));
    }
}
