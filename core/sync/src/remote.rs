//! Remote backend contract and an in-memory implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use jobsync_common::{record_id, EntityType, Error, Record};

/// Failure reported by the remote backend.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server holds a divergent version of the record.
    #[error("Conflict with server version")]
    Conflict { server: Record },

    #[error("Rejected by server: {0}")]
    Rejected(String),
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(msg) => Error::Network(msg),
            RemoteError::Auth(msg) => Error::Authentication(msg),
            RemoteError::Conflict { .. } => Error::Conflict(err.to_string()),
            RemoteError::Rejected(msg) => Error::InvalidInput(msg),
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Per-entity operations exposed by the backend, scoped by owner.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; the sync manager shares one
/// instance between its passes and the scheduler.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Create a record; returns the server's copy.
    async fn insert(&self, entity: EntityType, record: &Record) -> RemoteResult<Record>;

    /// Apply `patch` to the record `id`; returns the server's copy.
    async fn update(&self, entity: EntityType, id: &str, patch: &Record) -> RemoteResult<Record>;

    /// Records of `owner_id`, optionally without soft-deleted ones.
    async fn list(
        &self,
        entity: EntityType,
        owner_id: &str,
        exclude_deleted: bool,
    ) -> RemoteResult<Vec<Record>>;
}

/// Kind of call recorded by [`MemoryRemote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Insert,
    Update,
    List,
}

/// One call made against a [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub entity: EntityType,
    /// Record id for insert/update, owner id for list.
    pub key: String,
    pub payload: Option<Record>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<EntityType, BTreeMap<String, Record>>,
    calls: Vec<RemoteCall>,
    /// Returned by the next calls, in order.
    queued_failures: VecDeque<RemoteError>,
    /// Record ids whose writes always fail.
    failing_ids: HashMap<String, RemoteError>,
    /// Record ids whose next write reports a conflict.
    conflicting_ids: HashSet<String>,
}

/// In-memory backend.
///
/// Useful for testing and offline demos. Records every call and can be
/// scripted to fail or report conflicts.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a server-side record directly.
    pub fn seed(&self, entity: EntityType, record: Record) {
        if let Some(id) = record_id(&record).map(str::to_string) {
            self.state().tables.entry(entity).or_default().insert(id, record);
        }
    }

    pub fn get(&self, entity: EntityType, id: &str) -> Option<Record> {
        self.state().tables.get(&entity)?.get(id).cloned()
    }

    /// Fail the next call with `err`.
    pub fn push_failure(&self, err: RemoteError) {
        self.state().queued_failures.push_back(err);
    }

    /// Fail every write to `id` with `err` until cleared.
    pub fn fail_record(&self, id: &str, err: RemoteError) {
        self.state().failing_ids.insert(id.to_string(), err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.queued_failures.clear();
        state.failing_ids.clear();
    }

    /// Report a conflict on the next write to `id`.
    pub fn conflict_on(&self, id: &str) {
        self.state().conflicting_ids.insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Record the call and return a scripted failure, if any.
    fn begin(&self, call: RemoteCall, write_id: Option<&str>) -> RemoteResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.state();
        let entity = call.entity;
        state.calls.push(call);

        if let Some(err) = state.queued_failures.pop_front() {
            return Err(err);
        }
        if let Some(id) = write_id {
            if let Some(err) = state.failing_ids.get(id) {
                return Err(err.clone());
            }
            if state.conflicting_ids.remove(id) {
                let server = state
                    .tables
                    .get(&entity)
                    .and_then(|t| t.get(id))
                    .cloned()
                    .unwrap_or_default();
                return Err(RemoteError::Conflict { server });
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl RemoteService for MemoryRemote {
    async fn insert(&self, entity: EntityType, record: &Record) -> RemoteResult<Record> {
        self.simulate_latency().await;

        let id = record_id(record)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Rejected("Record has no id".to_string()))?;
        let call = RemoteCall {
            op: RemoteOp::Insert,
            entity,
            key: id.clone(),
            payload: Some(record.clone()),
        };
        let mut state = self.begin(call, Some(&id))?;

        let table = state.tables.entry(entity).or_default();
        if let Some(existing) = table.get(&id) {
            return Err(RemoteError::Conflict {
                server: existing.clone(),
            });
        }
        table.insert(id, record.clone());
        Ok(record.clone())
    }

    async fn update(&self, entity: EntityType, id: &str, patch: &Record) -> RemoteResult<Record> {
        self.simulate_latency().await;

        let call = RemoteCall {
            op: RemoteOp::Update,
            entity,
            key: id.to_string(),
            payload: Some(patch.clone()),
        };
        let mut state = self.begin(call, Some(id))?;

        let existing = state
            .tables
            .entry(entity)
            .or_default()
            .get_mut(id)
            .ok_or_else(|| RemoteError::Rejected(format!("{} {} not found", entity, id)))?;
        for (field, value) in patch {
            existing.insert(field.clone(), value.clone());
        }
        Ok(existing.clone())
    }

    async fn list(
        &self,
        entity: EntityType,
        owner_id: &str,
        exclude_deleted: bool,
    ) -> RemoteResult<Vec<Record>> {
        self.simulate_latency().await;

        let call = RemoteCall {
            op: RemoteOp::List,
            entity,
            key: owner_id.to_string(),
            payload: None,
        };
        let state = self.begin(call, None)?;

        Ok(state
            .tables
            .get(&entity)
            .map(|table| {
                table
                    .values()
                    .filter(|r| r.get("owner_id").and_then(Value::as_str) == Some(owner_id))
                    .filter(|r| {
                        !exclude_deleted || r.get("deleted_at").map_or(true, Value::is_null)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_update_list() {
        let remote = MemoryRemote::new();
        remote
            .insert(EntityType::Job, &record(json!({"id": "j1", "owner_id": "u1", "title": "A"})))
            .await
            .unwrap();
        remote
            .insert(EntityType::Job, &record(json!({"id": "j2", "owner_id": "u2"})))
            .await
            .unwrap();

        let updated = remote
            .update(EntityType::Job, "j1", &record(json!({"title": "B"})))
            .await
            .unwrap();
        assert_eq!(updated["title"], json!("B"));
        assert_eq!(updated["owner_id"], json!("u1"));

        let listed = remote.list(EntityType::Job, "u1", true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(remote.call_count(), 4);
        assert_eq!(remote.calls()[2].op, RemoteOp::Update);
    }

    #[tokio::test]
    async fn test_list_excludes_soft_deleted() {
        let remote = MemoryRemote::new();
        remote.seed(
            EntityType::Client,
            record(json!({"id": "c1", "owner_id": "u1", "deleted_at": "2026-02-13T10:00:00Z"})),
        );
        remote.seed(
            EntityType::Client,
            record(json!({"id": "c2", "owner_id": "u1", "deleted_at": null})),
        );

        assert_eq!(remote.list(EntityType::Client, "u1", true).await.unwrap().len(), 1);
        assert_eq!(remote.list(EntityType::Client, "u1", false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let remote = MemoryRemote::new();
        let server = record(json!({"id": "q1", "total": 5}));
        remote.seed(EntityType::Quote, server.clone());

        match remote.insert(EntityType::Quote, &record(json!({"id": "q1"}))).await {
            Err(RemoteError::Conflict { server: copy }) => assert_eq!(copy, server),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let remote = MemoryRemote::new();
        remote.seed(EntityType::Invoice, record(json!({"id": "i1"})));

        remote.push_failure(RemoteError::Network("offline".to_string()));
        assert!(matches!(
            remote.update(EntityType::Invoice, "i1", &Record::new()).await,
            Err(RemoteError::Network(_))
        ));
        assert!(remote.update(EntityType::Invoice, "i1", &Record::new()).await.is_ok());

        remote.conflict_on("i1");
        assert!(matches!(
            remote.update(EntityType::Invoice, "i1", &Record::new()).await,
            Err(RemoteError::Conflict { .. })
        ));
        assert!(remote.update(EntityType::Invoice, "i1", &Record::new()).await.is_ok());

        remote.fail_record("i1", RemoteError::Rejected("bad".to_string()));
        for _ in 0..2 {
            assert!(remote.update(EntityType::Invoice, "i1", &Record::new()).await.is_err());
        }
        remote.clear_failures();
        assert!(remote.update(EntityType::Invoice, "i1", &Record::new()).await.is_ok());
    }

    #[test]
    fn test_remote_error_conversion() {
        let err: Error = RemoteError::Auth("expired".to_string()).into();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
