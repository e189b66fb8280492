//! Sync manager: queue replay, bulk refresh and notifications.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use jobsync_common::{now_timestamp, EntityType, Error, MutationAction, Record, Result};
use jobsync_storage::{
    last_fetch_key, migrate_to_encrypted, EncryptedStore, EncryptionMigrationReport, NewQueueItem,
    QueueItem, QueuePatch,
};

use crate::config::SyncConfig;
use crate::conflict::{format_conflict_message, ConflictResolver, ConflictStrategy};
use crate::events::{ListenerSet, Subscription, SyncEvent, SyncPhase};
use crate::remote::{RemoteError, RemoteResult, RemoteService};
use crate::retry::RetryExecutor;

const QUEUE_CORRUPTED_MESSAGE: &str =
    "Pending changes could not be read and were cleared. Recent offline edits may need to be re-entered.";
const QUOTA_EXCEEDED_MESSAGE: &str =
    "Device storage is full. Free up space to keep working offline.";

/// Outcome of one queue replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub success: usize,
    pub failed: usize,
    /// Items skipped this pass: still backing off, or behind an earlier
    /// item of the same entity that could not be synced.
    pub deferred: usize,
}

/// Outcome of a bulk refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    /// Records stored per entity kind.
    pub stored: BTreeMap<EntityType, usize>,
    pub failed: Vec<EntityType>,
}

/// Resets the single-flight flag when a pass ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn is_deleted(record: &Record) -> bool {
    record.get("deleted_at").is_some_and(|v| !v.is_null())
}

/// The local `deleted_at` when the local side is soft-deleted and the
/// server side is not.
fn deletion_diverges<'a>(local: &'a Record, server: &Record) -> Option<&'a Value> {
    if is_deleted(server) {
        return None;
    }
    local.get("deleted_at").filter(|v| !v.is_null())
}

/// Single point of control for queue replay and bulk refresh.
///
/// The only component talking to the remote service. Construct once and
/// share through `Arc`.
pub struct SyncManager {
    store: EncryptedStore,
    remote: Arc<dyn RemoteService>,
    config: SyncConfig,
    resolver: ConflictResolver,
    retry: RetryExecutor,
    syncing: AtomicBool,
    online: AtomicBool,
    completion: ListenerSet<SyncSummary>,
    events: ListenerSet<SyncEvent>,
}

impl SyncManager {
    /// Create a manager. It starts offline until told otherwise.
    pub fn new(store: EncryptedStore, remote: Arc<dyn RemoteService>, config: SyncConfig) -> Self {
        let resolver = ConflictResolver::new(config.conflict_strategy);
        let retry = RetryExecutor::new(config.max_retries, config.backoff.clone());

        Self {
            store,
            remote,
            config,
            resolver,
            retry,
            syncing: AtomicBool::new(false),
            online: AtomicBool::new(false),
            completion: ListenerSet::new(),
            events: ListenerSet::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &EncryptedStore {
        &self.store
    }

    /// Run the one-time re-encryption of legacy rows. Failures are logged
    /// and retried on the next start.
    pub fn run_encryption_migration(&self) -> Option<EncryptionMigrationReport> {
        match migrate_to_encrypted(&self.store) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Encryption migration failed, will retry next start: {}", e);
                self.handle_store_error(&e);
                None
            }
        }
    }

    /// Record network state. Returns `true` on an offline to online
    /// transition.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        match (was_online, online) {
            (false, true) => {
                info!("Connection restored");
                true
            }
            (true, false) => {
                info!("Connection lost; mutations will queue locally");
                false
            }
            _ => false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Whether a replay pass is in progress.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Register a callback run after every replay pass.
    pub fn on_sync_complete(
        &self,
        listener: impl Fn(&SyncSummary) + Send + Sync + 'static,
    ) -> Subscription {
        self.completion.subscribe(listener)
    }

    /// Register a callback for UI notifications.
    pub fn subscribe(&self, listener: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(listener)
    }

    /// Queue a local mutation and, when online, start a replay in the
    /// background.
    ///
    /// Never fails: invalid or unpersistable mutations are logged (and
    /// surfaced as events where the UI should know) and `None` is returned.
    pub fn queue_sync(
        self: &Arc<Self>,
        entity: EntityType,
        entity_id: &str,
        action: MutationAction,
        mut data: Value,
    ) -> Option<i64> {
        if entity_id.trim().is_empty() {
            warn!("Dropped {} {} mutation without an entity id", action, entity);
            return None;
        }
        if action == MutationAction::Delete {
            if let Value::Object(fields) = &mut data {
                // The delete is a write: it must beat older server copies
                // under last-write-wins.
                let now = now_timestamp();
                fields
                    .entry("deleted_at")
                    .or_insert_with(|| Value::String(now.clone()));
                fields
                    .entry("updated_at")
                    .or_insert_with(|| Value::String(now));
            }
        }

        let item = NewQueueItem::new(entity, entity_id, action, data);
        let id = match self.store.store().add_queue_item(&item) {
            Ok(id) => id,
            Err(Error::Validation(errors)) => {
                warn!(
                    "Dropped invalid {} {} mutation for {}: {}",
                    action,
                    entity,
                    entity_id,
                    errors.join("; ")
                );
                return None;
            }
            Err(e) => {
                self.handle_store_error(&e);
                return None;
            }
        };

        if self.is_online() {
            self.spawn_process_queue();
        }
        Some(id)
    }

    fn spawn_process_queue(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(self);
                handle.spawn(async move {
                    manager.process_queue().await;
                });
            }
            Err(_) => debug!("No async runtime; mutation waits for the next replay"),
        }
    }

    /// Replay pending mutations against the remote service.
    ///
    /// A no-op returning an empty summary when offline or when another
    /// pass is already running.
    pub async fn process_queue(&self) -> SyncSummary {
        if !self.is_online() {
            debug!("Offline, skipping queue replay");
            return SyncSummary::default();
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Queue replay already in progress");
            return SyncSummary::default();
        }

        let flight = FlightGuard(&self.syncing);
        let summary = self.replay_queue().await;
        drop(flight);

        if summary != SyncSummary::default() {
            info!(
                "Queue replay finished: {} synced, {} failed, {} deferred",
                summary.success, summary.failed, summary.deferred
            );
        }
        self.completion.notify(&summary);
        summary
    }

    async fn replay_queue(&self) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let items = match self.store.store().pending_queue_items() {
            Ok(items) => items,
            Err(e) => {
                self.handle_store_error(&e);
                return summary;
            }
        };
        if items.is_empty() {
            return summary;
        }

        let total = items.len();
        let now = Utc::now();
        // Entities with an item that could not be synced this pass.
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();

        for (index, item) in items.iter().enumerate() {
            let key = (item.entity_type, item.entity_id.clone());
            if blocked.contains(&key) {
                summary.deferred += 1;
                continue;
            }
            if !self
                .config
                .backoff
                .is_due(item.retry_count, item.updated_at.as_deref(), now)
            {
                debug!("Queue item #{} still backing off", item.id);
                blocked.insert(key);
                summary.deferred += 1;
                continue;
            }

            self.events.notify(&SyncEvent::progress(
                index,
                total,
                Some(format!("{} {}", item.entity_type.display_name(), item.entity_id)),
                SyncPhase::Upload,
            ));

            let outcome = match self.dispatch(item).await {
                Ok(_) => Ok(()),
                Err(RemoteError::Conflict { server }) => self.reconcile(item, server).await,
                Err(e) => Err(Error::from(e)),
            };

            match outcome {
                Ok(()) => {
                    if let Err(e) = self
                        .store
                        .store()
                        .update_queue_item(item.id, &QueuePatch::synced())
                    {
                        self.handle_store_error(&e);
                        return summary;
                    }
                    summary.success += 1;
                }
                Err(Error::Authentication(msg)) => {
                    warn!("Session expired during sync: {}", msg);
                    self.events.notify(&SyncEvent::AuthError { message: msg });
                    return summary;
                }
                Err(e) => {
                    summary.failed += 1;
                    blocked.insert(key);
                    if let Err(store_err) = self.record_failure(item, &e.to_string()) {
                        self.handle_store_error(&store_err);
                        return summary;
                    }
                }
            }
        }

        self.events
            .notify(&SyncEvent::progress(total, total, None, SyncPhase::Upload));
        summary
    }

    async fn dispatch(&self, item: &QueueItem) -> RemoteResult<Record> {
        let mut payload = item.data.clone();
        debug!(
            "Replaying {} {} {} (#{})",
            item.action, item.entity_type, item.entity_id, item.id
        );

        match item.action {
            MutationAction::Create => {
                payload
                    .entry("id")
                    .or_insert_with(|| Value::String(item.entity_id.clone()));
                self.remote.insert(item.entity_type, &payload).await
            }
            MutationAction::Update => {
                self.remote
                    .update(item.entity_type, &item.entity_id, &payload)
                    .await
            }
            MutationAction::Delete => {
                payload
                    .entry("deleted_at")
                    .or_insert_with(|| Value::String(now_timestamp()));
                self.remote
                    .update(item.entity_type, &item.entity_id, &payload)
                    .await
            }
        }
    }

    /// Settle a conflict reported by the remote for `item`.
    async fn reconcile(&self, item: &QueueItem, server: Record) -> Result<()> {
        let entity = item.entity_type;
        if server.is_empty() {
            return Err(Error::Conflict(format!(
                "Server reported a conflict on {} {} without its version",
                entity, item.entity_id
            )));
        }

        let mut local = self
            .store
            .table(entity)
            .get(&item.entity_id)?
            .unwrap_or_default();
        for (field, value) in &item.data {
            local.insert(field.clone(), value.clone());
        }
        local
            .entry("id")
            .or_insert_with(|| Value::String(item.entity_id.clone()));

        let mut resolution = self.resolver.resolve(&local, &server);
        let mut fields = self.resolver.conflicting_fields(&local, &server);

        // `deleted_at` is ignored by field comparison and never taken by a
        // merge, so a local soft delete needs its own handling.
        if let Some(deleted_at) = deletion_diverges(&local, &server) {
            if resolution.strategy == ConflictStrategy::Merge {
                resolution
                    .resolved
                    .insert("deleted_at".to_string(), deleted_at.clone());
            }
            if is_deleted(&resolution.resolved) {
                debug!("Pushing local delete of {} {}", entity, item.entity_id);
            } else {
                resolution.had_conflict = true;
                fields.push("deleted_at".to_string());
                fields.sort();
            }
        }

        if resolution.had_conflict {
            info!(
                "Conflict on {} {} ({}): {}",
                entity,
                item.entity_id,
                resolution.strategy,
                resolution.message
            );
            self.events.notify(&SyncEvent::ConflictDetected {
                entity_type: entity,
                entity_id: item.entity_id.clone(),
                message: format_conflict_message(entity, &fields),
                fields,
            });
        }

        if let Err(e) = self.store.table(entity).put(&resolution.resolved) {
            self.handle_store_error(&e);
            return Err(e);
        }

        if resolution.resolved != server {
            self.remote
                .update(entity, &item.entity_id, &resolution.resolved)
                .await?;
        }
        Ok(())
    }

    fn record_failure(&self, item: &QueueItem, error: &str) -> Result<()> {
        let attempts = item.retry_count + 1;

        if attempts >= self.config.max_retries {
            warn!(
                "Giving up on {} {} {} after {} attempts: {}",
                item.action, item.entity_type, item.entity_id, attempts, error
            );
            let annotated = format!("Abandoned after {} attempts: {}", attempts, error);
            self.store
                .store()
                .update_queue_item(item.id, &QueuePatch::abandoned(attempts, annotated.clone()))?;
            self.events.notify(&SyncEvent::MutationAbandoned {
                entity_type: item.entity_type,
                entity_id: item.entity_id.clone(),
                action: item.action,
                error: annotated,
            });
        } else {
            debug!(
                "Queue item #{} failed (attempt {}): {}",
                item.id, attempts, error
            );
            self.store
                .store()
                .update_queue_item(item.id, &QueuePatch::failed(attempts, error))?;
        }
        Ok(())
    }

    /// Replace local collections with the server's records for `owner_id`.
    ///
    /// A no-op when offline. The queue is untouched, so unsynced mutations
    /// are replayed on the next pass.
    pub async fn fetch_and_store(&self, owner_id: &str) -> FetchSummary {
        let mut summary = FetchSummary::default();
        if !self.is_online() {
            debug!("Offline, skipping bulk refresh");
            return summary;
        }

        let lists = join_all(EntityType::ALL.into_iter().map(|entity| async move {
            let result = self
                .retry
                .execute(|| async move {
                    self.remote
                        .list(entity, owner_id, true)
                        .await
                        .map_err(Error::from)
                })
                .await;
            (entity, result)
        }))
        .await;

        let total = lists.len();
        let mut auth_reported = false;
        for (index, (entity, result)) in lists.into_iter().enumerate() {
            let stored = result.and_then(|records| {
                let count = self.store.table(entity).bulk_put(&records)?;
                self.store
                    .store()
                    .set_metadata(&last_fetch_key(entity), &now_timestamp())?;
                Ok(count)
            });

            match stored {
                Ok(count) => {
                    debug!("Stored {} {} from server", count, entity.table_name());
                    summary.stored.insert(entity, count);
                }
                Err(Error::Authentication(msg)) => {
                    if !auth_reported {
                        warn!("Session expired during refresh: {}", msg);
                        self.events.notify(&SyncEvent::AuthError { message: msg });
                        auth_reported = true;
                    }
                    summary.failed.push(entity);
                }
                Err(e) => {
                    warn!("Refreshing {} failed: {}", entity.table_name(), e);
                    self.handle_store_error(&e);
                    summary.failed.push(entity);
                }
            }

            self.events.notify(&SyncEvent::progress(
                index + 1,
                total,
                Some(entity.display_name().to_string()),
                SyncPhase::Download,
            ));
        }

        info!(
            "Bulk refresh for {}: {} stored, {} failed",
            owner_id,
            summary.stored.values().sum::<usize>(),
            summary.failed.len()
        );
        summary
    }

    /// Number of mutations awaiting replay; 0 if the queue is unreadable.
    pub fn get_pending_sync_count(&self) -> u64 {
        match self.store.store().count_pending() {
            Ok(count) => count,
            Err(e) => {
                self.handle_store_error(&e);
                0
            }
        }
    }

    /// Every queue item, for display.
    pub fn get_sync_queue(&self) -> Vec<QueueItem> {
        match self.store.store().queue_items() {
            Ok(items) => items,
            Err(e) => {
                self.handle_store_error(&e);
                Vec::new()
            }
        }
    }

    /// Drop every queued mutation.
    pub fn clear_queue(&self) -> Result<()> {
        self.store.store().clear_queue()
    }

    /// Wipe local data and destroy the encryption key.
    pub fn logout(&self) -> Result<()> {
        self.store.store().wipe()?;
        self.store.cipher().destroy_key()?;
        info!("Logged out; local data wiped");
        Ok(())
    }

    /// Turn store failures into recovery actions and UI events.
    fn handle_store_error(&self, err: &Error) {
        match err {
            Error::Corruption(msg) => {
                warn!("Sync queue unreadable: {}", msg);
                match self.store.store().recover_corrupted_queue() {
                    Ok(true) => self.events.notify(&SyncEvent::QueueCorrupted {
                        message: QUEUE_CORRUPTED_MESSAGE.to_string(),
                    }),
                    Ok(false) => {}
                    Err(e) => error!("Queue recovery failed: {}", e),
                }
            }
            Error::QuotaExceeded(msg) => {
                warn!("Local storage full: {}", msg);
                self.events.notify(&SyncEvent::StorageQuotaExceeded {
                    message: QUOTA_EXCEEDED_MESSAGE.to_string(),
                });
            }
            other => warn!("Local store error: {}", other),
        }
    }
}
