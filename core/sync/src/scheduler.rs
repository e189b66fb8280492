//! Sync scheduling: reconnect-triggered and periodic passes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::manager::SyncManager;

/// Background task driving a [`SyncManager`].
///
/// Replays the queue once per offline to online transition of the network
/// signal and, if configured, on a fixed interval (replay plus a bulk
/// refresh of the configured owner).
pub struct SyncScheduler {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Spawn the scheduler on the current tokio runtime.
    pub fn spawn(manager: Arc<SyncManager>, network: watch::Receiver<bool>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(manager, network, shutdown_rx));
        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Stop the scheduler and wait for an in-flight pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

fn periodic_interval(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn wait_for_periodic(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn on_network_change(manager: &SyncManager, online: bool) {
    if manager.set_online(online) {
        debug!("Reconnected, replaying queue");
        manager.process_queue().await;
    }
}

async fn periodic_pass(manager: &SyncManager) {
    if !manager.is_online() {
        debug!("Offline, skipping periodic sync");
        return;
    }
    let summary = manager.process_queue().await;
    debug!(
        "Periodic replay: {} synced, {} failed",
        summary.success, summary.failed
    );
    if let Some(owner_id) = manager.config().owner_id.as_deref() {
        manager.fetch_and_store(owner_id).await;
    }
}

async fn run(
    manager: Arc<SyncManager>,
    mut network: watch::Receiver<bool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = manager.config().periodic_interval().map(periodic_interval);
    let mut network_open = true;

    info!("Sync scheduler started");
    let initial = *network.borrow_and_update();
    on_network_change(&manager, initial).await;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Sync scheduler shutting down");
                break;
            }
            changed = network.changed(), if network_open => {
                if changed.is_err() {
                    debug!("Network signal closed");
                    network_open = false;
                    continue;
                }
                let online = *network.borrow_and_update();
                on_network_change(&manager, online).await;
            }
            _ = wait_for_periodic(&mut ticker) => {
                periodic_pass(&manager).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::remote::MemoryRemote;
    use crate::retry::BackoffConfig;
    use jobsync_common::{EntityType, MutationAction};
    use jobsync_crypto::{FieldCipher, MemoryKeyStore};
    use jobsync_storage::{EncryptedStore, LocalStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(config: SyncConfig, remote: Arc<MemoryRemote>) -> Arc<SyncManager> {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let cipher = Arc::new(FieldCipher::new(Arc::new(MemoryKeyStore::new())));
        Arc::new(SyncManager::new(
            EncryptedStore::new(store, cipher),
            remote,
            config,
        ))
    }

    fn config() -> SyncConfig {
        SyncConfig {
            backoff: BackoffConfig::immediate(),
            ..Default::default()
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_reconnect_triggers_one_pass_per_transition() {
        let remote = Arc::new(MemoryRemote::new());
        let manager = manager(config(), remote.clone());
        let passes = Arc::new(AtomicUsize::new(0));
        let counter = passes.clone();
        let _sub = manager.on_sync_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let id = uuid::Uuid::new_v4().to_string();
        manager
            .queue_sync(EntityType::Job, &id, MutationAction::Create, json!({"title": "Gutter"}))
            .unwrap();

        let (network_tx, network_rx) = watch::channel(false);
        let scheduler = SyncScheduler::spawn(manager.clone(), network_rx);

        network_tx.send(true).unwrap();
        wait_until(|| passes.load(Ordering::SeqCst) == 1).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);
        assert_eq!(remote.call_count(), 1);

        // Still online: no transition, no pass.
        network_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        // Going offline alone triggers nothing.
        network_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);
        assert!(!manager.is_online());

        network_tx.send(true).unwrap();
        wait_until(|| passes.load(Ordering::SeqCst) == 2).await;
        assert_eq!(passes.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_initially_online_replays_at_start() {
        let remote = Arc::new(MemoryRemote::new());
        let manager = manager(config(), remote.clone());
        let id = uuid::Uuid::new_v4().to_string();
        manager
            .queue_sync(EntityType::Client, &id, MutationAction::Create, json!({"name": "Ann"}))
            .unwrap();

        let (_network_tx, network_rx) = watch::channel(true);
        let scheduler = SyncScheduler::spawn(manager.clone(), network_rx);

        wait_until(|| manager.get_pending_sync_count() == 0).await;
        assert_eq!(manager.get_pending_sync_count(), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_pass_refreshes_owner() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(
            EntityType::Job,
            json!({"id": "j1", "owner_id": "u1"}).as_object().cloned().unwrap(),
        );
        let mut cfg = config();
        cfg.periodic_interval_secs = Some(1);
        cfg.owner_id = Some("u1".to_string());
        let manager = manager(cfg, remote.clone());

        let (_network_tx, network_rx) = watch::channel(true);
        let scheduler = SyncScheduler::spawn(manager.clone(), network_rx);

        for _ in 0..300 {
            if manager.store().table(EntityType::Job).count().unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.store().table(EntityType::Job).count().unwrap(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_closed_network_signal() {
        let manager = manager(config(), Arc::new(MemoryRemote::new()));
        let (network_tx, network_rx) = watch::channel(false);
        let scheduler = SyncScheduler::spawn(manager, network_rx);
        drop(network_tx);

        tokio::time::timeout(Duration::from_secs(1), scheduler.shutdown())
            .await
            .unwrap();
    }
}
