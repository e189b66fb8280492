//! Typed notifications published by the sync manager.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use jobsync_common::{EntityType, MutationAction};

/// Which half of a sync the progress refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// Replaying queued mutations.
    Upload,
    /// Refreshing local collections from the server.
    Download,
}

/// Event surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Device storage is full; the write was lost.
    StorageQuotaExceeded { message: String },
    /// The session expired mid-sync; pending items stay queued.
    AuthError { message: String },
    /// The queue table was rebuilt and its pending items dropped.
    QueueCorrupted { message: String },
    ConflictDetected {
        entity_type: EntityType,
        entity_id: String,
        fields: Vec<String>,
        message: String,
    },
    SyncProgress {
        percentage: u8,
        completed: usize,
        total: usize,
        current_entity: Option<String>,
        phase: SyncPhase,
    },
    /// A mutation hit the retry ceiling and will not be replayed.
    MutationAbandoned {
        entity_type: EntityType,
        entity_id: String,
        action: MutationAction,
        error: String,
    },
}

impl SyncEvent {
    pub(crate) fn progress(
        completed: usize,
        total: usize,
        current_entity: Option<String>,
        phase: SyncPhase,
    ) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            ((completed * 100) / total).min(100) as u8
        };
        SyncEvent::SyncProgress {
            percentage,
            completed,
            total,
            current_entity,
            phase,
        }
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

/// A set of callbacks notified in subscription order.
pub struct ListenerSet<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    /// Register a callback; keep the returned handle to unsubscribe.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, Arc::new(listener));

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut registry = inner.lock().unwrap_or_else(|e| e.into_inner());
                    registry.listeners.remove(&id);
                }
            })),
        }
    }

    /// Invoke every listener with `value`.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe.
    pub fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = {
            let registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            registry.listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`ListenerSet::subscribe`].
///
/// Dropping it keeps the listener registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
