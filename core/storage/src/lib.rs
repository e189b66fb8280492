//! Durable local storage for JobSync.
//!
//! This module provides:
//! - A SQLite-backed store for jobs, quotes, invoices and clients
//! - The mutation queue replayed against the remote backend
//! - A versioned schema pipeline with per-step data fixups
//! - Shape validation for queued mutations
//! - Transparent field encryption and the one-time legacy re-encryption
//!
//! # Design Principles
//! - Records are kept as JSON; only declared fields are indexed
//! - Every row carries an explicit encryption marker
//! - A broken queue table is rebuilt rather than blocking the app

pub mod encrypted;
pub mod encryption_migration;
pub mod queue;
pub mod schema;
pub mod store;
pub mod validator;

pub use encrypted::{EncryptedStore, EncryptedTable};
pub use encryption_migration::{migrate_to_encrypted, EncryptionMigrationReport};
pub use queue::{NewQueueItem, QueueItem, QueuePatch, QueueState};
pub use schema::{current_version, FixupFailure, MigrationReport};
pub use store::{
    last_fetch_key, EntityTable, LocalStore, StoreConfig, StoreStats, StoredRecord,
    META_ENCRYPTION_MIGRATED,
};
pub use validator::{validate_queue_item, ValidationResult, MAX_DATA_BYTES};
