//! Retry policy with exponential backoff
//!
//! Listener RPC calls and dispatcher requeues both schedule their retries
//! through a [`RetryPolicy`], so backoff behaviour can be unit tested without
//! any I/O.

use crate::error::RelayerResult;

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed before giving up (including the first one)
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

fn default_multiplier() -> u32 {
    2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(exponent);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Run `op`, retrying retryable errors with backoff.
    ///
    /// Non-retryable errors are returned immediately.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> RelayerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.should_retry(attempts) => {
                    let delay = self.backoff(attempts);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what, attempts, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            multiplier: 2,
        }
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_should_retry() {
        let p = policy();
        assert!(p.should_retry(3));
        assert!(!p.should_retry(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .retry("latest_block", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(RelayerError::TransientNetwork {
                        chain_id: 1,
                        message: "connection reset".into(),
                    })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: RelayerResult<()> = policy()
            .retry("get_logs", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayerError::TransientNetwork {
                    chain_id: 1,
                    message: "503".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: RelayerResult<()> = policy()
            .retry("submit", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayerError::Storage("io".into()))
            })
            .await;

        assert!(matches!(result, Err(RelayerError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
