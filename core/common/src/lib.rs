//! Common utilities and types shared across JobSync modules.
//!
//! This module provides the entity vocabulary (entity kinds, mutation
//! actions, JSON records) and the error type used by every other crate.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    normalize_timestamp, now_timestamp, parse_timestamp, record_id, record_timestamp, EntityType,
    MutationAction, Record,
};
