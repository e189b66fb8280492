//! Common types used throughout JobSync.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A business entity as stored locally and exchanged with the server.
///
/// Records are schemaless JSON objects; the sync layer only relies on
/// `id`, `owner_id`, `created_at`, `updated_at` and `deleted_at`.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Kind of synchronized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Job,
    Quote,
    Invoice,
    Client,
}

impl EntityType {
    /// All entity kinds, in the order collections are refreshed.
    pub const ALL: [EntityType; 4] = [
        EntityType::Job,
        EntityType::Quote,
        EntityType::Invoice,
        EntityType::Client,
    ];

    /// Wire name used in queue rows (`"job"`, `"quote"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Job => "job",
            EntityType::Quote => "quote",
            EntityType::Invoice => "invoice",
            EntityType::Client => "client",
        }
    }

    /// Name of the local table and of the remote collection.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::Job => "jobs",
            EntityType::Quote => "quotes",
            EntityType::Invoice => "invoices",
            EntityType::Client => "clients",
        }
    }

    /// Human readable name for notifications.
    pub fn display_name(&self) -> &'static str {
        match self {
            EntityType::Job => "Job",
            EntityType::Quote => "Quote",
            EntityType::Invoice => "Invoice",
            EntityType::Client => "Client",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "job" => Ok(EntityType::Job),
            "quote" => Ok(EntityType::Quote),
            "invoice" => Ok(EntityType::Invoice),
            "client" => Ok(EntityType::Client),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown entity type: {}",
                other
            ))),
        }
    }
}

/// Mutation recorded in the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    /// Soft delete: replayed as an update that sets `deleted_at`.
    Delete,
}

impl MutationAction {
    pub const ALL: [MutationAction; 3] = [
        MutationAction::Create,
        MutationAction::Update,
        MutationAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            "delete" => Ok(MutationAction::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown action: {}",
                other
            ))),
        }
    }
}

/// Current time as an RFC 3339 string with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp, normalizing to UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Rewrite an RFC 3339 timestamp as UTC with millisecond precision.
///
/// Normalized timestamps order correctly as plain text.
pub fn normalize_timestamp(value: &str) -> Option<String> {
    parse_timestamp(value).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Read a timestamp field from a record.
///
/// Returns `None` when the field is missing, not a string, or unparsable.
pub fn record_timestamp(record: &Record, field: &str) -> Option<DateTime<Utc>> {
    record
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp)
}

/// The record's `id` field, if it is a string.
pub fn record_id(record: &Record) -> Option<&str> {
    record.get("id").and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_names() {
        assert_eq!(EntityType::Invoice.as_str(), "invoice");
        assert_eq!(EntityType::Invoice.table_name(), "invoices");
        assert_eq!("client".parse::<EntityType>().unwrap(), EntityType::Client);
        assert!("customer".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_entity_type_serde() {
        let json = serde_json::to_string(&EntityType::Quote).unwrap();
        assert_eq!(json, "\"quote\"");
        let back: EntityType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntityType::Quote);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("delete".parse::<MutationAction>().unwrap(), MutationAction::Delete);
        assert!("remove".parse::<MutationAction>().is_err());
    }

    #[test]
    fn test_record_timestamp() {
        let record = json!({"id": "a", "updated_at": "2026-02-13T10:00:00Z", "bad": 5})
            .as_object()
            .cloned()
            .unwrap();

        assert!(record_timestamp(&record, "updated_at").is_some());
        assert!(record_timestamp(&record, "bad").is_none());
        assert!(record_timestamp(&record, "missing").is_none());
        assert_eq!(record_id(&record), Some("a"));
    }

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(
            normalize_timestamp("2026-02-13T12:00:00+05:00").as_deref(),
            Some("2026-02-13T07:00:00.000Z")
        );
        assert_eq!(
            normalize_timestamp("2026-02-13T10:00:00.5Z").as_deref(),
            Some("2026-02-13T10:00:00.500Z")
        );
        assert!(normalize_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_now_timestamp_parses() {
        assert!(parse_timestamp(&now_timestamp()).is_some());
    }

    proptest! {
        #[test]
        fn prop_parse_timestamp_never_panics(s in ".*") {
            let _ = parse_timestamp(&s);
        }
    }
}
