//! Mutation queue records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use jobsync_common::{now_timestamp, EntityType, Error, MutationAction, Record, Result};

/// Replay state of a queue item.
///
/// Stored as text and indexed, so "pending" lookups never go through a
/// boolean index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Waiting for remote confirmation.
    Pending,
    /// Confirmed by the remote service.
    Synced,
    /// Retry ceiling reached; kept for inspection but never replayed.
    Abandoned,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Synced => "synced",
            QueueState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueState::Pending),
            "synced" => Ok(QueueState::Synced),
            "abandoned" => Ok(QueueState::Abandoned),
            other => Err(Error::Corruption(format!("Unknown queue state: {}", other))),
        }
    }
}

/// A persisted pending (or settled) local mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: MutationAction,
    pub data: Record,
    pub created_at: String,
    pub updated_at: Option<String>,
    pub state: QueueState,
    pub sync_error: Option<String>,
    pub retry_count: u32,
}

impl QueueItem {
    /// Whether the item left the replay set (confirmed or given up).
    pub fn synced(&self) -> bool {
        self.state != QueueState::Pending
    }
}

/// A mutation about to enter the queue.
#[derive(Debug, Clone, Serialize)]
pub struct NewQueueItem {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: MutationAction,
    /// Raw payload; shape is checked by the validator before insertion.
    pub data: Value,
    pub created_at: String,
    pub retry_count: u32,
}

impl NewQueueItem {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        action: MutationAction,
        data: Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            action,
            data,
            created_at: now_timestamp(),
            retry_count: 0,
        }
    }

    /// Override the creation timestamp (used for ordering).
    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = created_at.into();
        self
    }
}

/// Partial update of a queue item; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct QueuePatch {
    pub state: Option<QueueState>,
    /// `Some(None)` clears the stored error.
    pub sync_error: Option<Option<String>>,
    pub retry_count: Option<u32>,
}

impl QueuePatch {
    /// Remote confirmed the mutation.
    pub fn synced() -> Self {
        Self {
            state: Some(QueueState::Synced),
            sync_error: Some(None),
            retry_count: None,
        }
    }

    /// Remote rejected the mutation; keep it pending for another pass.
    pub fn failed(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            state: None,
            sync_error: Some(Some(error.into())),
            retry_count: Some(retry_count),
        }
    }

    /// Retry ceiling reached.
    pub fn abandoned(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            state: Some(QueueState::Abandoned),
            sync_error: Some(Some(error.into())),
            retry_count: Some(retry_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_state_parse() {
        assert_eq!("abandoned".parse::<QueueState>().unwrap(), QueueState::Abandoned);
        assert!("true".parse::<QueueState>().is_err());
    }

    #[test]
    fn test_new_item_defaults() {
        let item = NewQueueItem::new(EntityType::Job, "id", MutationAction::Create, json!({}));
        assert_eq!(item.retry_count, 0);
        assert!(jobsync_common::parse_timestamp(&item.created_at).is_some());

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["entity_type"], json!("job"));
        assert_eq!(value["action"], json!("create"));
    }

    #[test]
    fn test_patch_constructors() {
        let patch = QueuePatch::synced();
        assert_eq!(patch.state, Some(QueueState::Synced));
        assert_eq!(patch.sync_error, Some(None));

        let patch = QueuePatch::abandoned(3, "boom");
        assert_eq!(patch.retry_count, Some(3));
        assert_eq!(patch.sync_error, Some(Some("boom".to_string())));
    }
}
