//! Common error types for JobSync.

use thiserror::Error;

/// Top-level error type for JobSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The local store is structurally damaged (e.g. the queue table).
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// The device ran out of storage quota.
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A mutation failed shape validation.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote service unreachable or failed in transit.
    #[error("Network error: {0}")]
    Network(String),

    /// Session expired or credentials rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
