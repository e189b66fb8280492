//! JobSync Sync Engine
//!
//! This module keeps a local store and the remote backend in step, including:
//! - Durable replay of queued mutations with per-entity ordering
//! - Retry accounting with exponential backoff and a give-up ceiling
//! - Conflict detection and resolution strategies
//! - Bulk refresh of local collections from the server
//! - Typed notifications and reconnect-driven scheduling

pub mod config;
pub mod conflict;
pub mod events;
pub mod http;
pub mod manager;
pub mod remote;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use config::SyncConfig;
pub use conflict::{
    batch_resolve_conflicts, conflicting_fields, format_conflict_message, has_conflict,
    resolve_conflict, resolve_conflict_named, ConflictResolver, ConflictStrategy, Resolution,
    DEFAULT_IGNORE_FIELDS, SERVER_COMPUTED_FIELDS,
};
pub use events::{ListenerSet, Subscription, SyncEvent, SyncPhase};
pub use http::{HttpRemote, RemoteConfig};
pub use manager::{FetchSummary, SyncManager, SyncSummary};
pub use remote::{MemoryRemote, RemoteCall, RemoteError, RemoteOp, RemoteResult, RemoteService};
pub use retry::{BackoffConfig, RetryExecutor};
pub use scheduler::SyncScheduler;
