//! Sync manager configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::conflict::ConflictStrategy;
use crate::retry::BackoffConfig;

/// Configuration for the sync manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts after which a queued mutation is abandoned.
    pub max_retries: u32,
    /// Strategy applied when the server holds a divergent version.
    pub conflict_strategy: ConflictStrategy,
    /// Minimum wait before retrying a failed mutation.
    pub backoff: BackoffConfig,
    /// Interval of the scheduler's periodic pass; `None` disables it.
    pub periodic_interval_secs: Option<u64>,
    /// Owner whose records the periodic pass refreshes.
    pub owner_id: Option<String>,
}

impl SyncConfig {
    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            backoff: BackoffConfig::default(),
            periodic_interval_secs: None,
            owner_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"conflict_strategy": "merge", "backoff": {"jitter": false}}"#)
                .unwrap();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Merge);
        assert!(!config.backoff.jitter);
        assert_eq!(config.backoff.initial_delay_ms, 1_000);
        assert!(config.periodic_interval().is_none());
    }

    #[test]
    fn test_zero_interval_disables_periodic() {
        let config = SyncConfig {
            periodic_interval_secs: Some(0),
            ..Default::default()
        };
        assert!(config.periodic_interval().is_none());
    }
}
