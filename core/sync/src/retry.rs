//! Retry policy with exponential backoff.
//!
//! Queue items carry their own retry counters across passes, so their
//! backoff is evaluated against the time of the last attempt. Bulk fetches
//! retry transient failures inline through [`RetryExecutor`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use jobsync_common::{parse_timestamp, Error, Result};

/// Exponential backoff between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay_ms: u64,
    /// Cap for exponential growth.
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Spread delays by +/- 25%.
    pub jitter: bool,
}

impl BackoffConfig {
    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Whether an item that failed `retry_count` times, last at
    /// `last_attempt`, may be attempted again at `now`.
    ///
    /// Items that never failed, or whose last attempt time is unknown, are
    /// always due.
    pub fn is_due(&self, retry_count: u32, last_attempt: Option<&str>, now: DateTime<Utc>) -> bool {
        if retry_count == 0 {
            return true;
        }
        let Some(last) = last_attempt.and_then(parse_timestamp) else {
            return true;
        };
        let delay = self.delay_for_attempt(retry_count - 1);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => now >= last + delay,
            Err(_) => false,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Runs an operation, retrying transient failures with backoff.
pub struct RetryExecutor {
    max_retries: u32,
    backoff: BackoffConfig,
}

impl RetryExecutor {
    pub fn new(max_retries: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Execute an operation with retry logic.
    ///
    /// Only network and I/O errors are retried.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !Self::is_retryable(&err) {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!("Operation failed after {} attempts: {}", attempt, err);
                        return Err(err);
                    }

                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn is_retryable(err: &Error) -> bool {
        matches!(err, Error::Network(_) | Error::Io(_))
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(3, BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_calculation() {
        let config = BackoffConfig::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = BackoffConfig::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = BackoffConfig::default().with_initial_delay(Duration::from_secs(4));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_secs(3) && delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_is_due() {
        let config = BackoffConfig::default()
            .with_initial_delay(Duration::from_secs(10))
            .with_jitter(false);
        let last = "2026-02-13T10:00:00Z";
        let at = |s: &str| parse_timestamp(s).unwrap();

        assert!(config.is_due(0, Some(last), at("2026-02-13T10:00:00Z")));
        assert!(!config.is_due(1, Some(last), at("2026-02-13T10:00:05Z")));
        assert!(config.is_due(1, Some(last), at("2026-02-13T10:00:10Z")));
        // Second failure doubles the wait.
        assert!(!config.is_due(2, Some(last), at("2026-02-13T10:00:15Z")));
        assert!(config.is_due(2, Some(last), at("2026-02-13T10:00:20Z")));
        assert!(config.is_due(3, None, at("2026-02-13T10:00:00Z")));
    }

    #[tokio::test]
    async fn test_retry_on_network_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();
        let executor = RetryExecutor::new(3, BackoffConfig::immediate());

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(Error::Network("Connection failed".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();
        let executor = RetryExecutor::new(3, BackoffConfig::immediate());

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Authentication("expired".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_retries_exceeded() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();
        let executor = RetryExecutor::new(2, BackoffConfig::immediate());

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network("Always fails".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        // Initial + 2 retries = 3 attempts
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }
}
