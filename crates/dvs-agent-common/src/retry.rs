//! Bounded retry for switch and control-plane calls.
//!
//! A [`RetryPolicy`] re-issues an operation while it fails with a transient
//! [`DvsError`] and the attempt budget is not exhausted. Domain errors (no
//! mapped switch, unsupported segment, invalid state) break out on the first
//! attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DvsError, DvsResult};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles after every failed attempt, up to the cap.
    #[default]
    Exponential,
}

/// Retry strategy: attempt budget plus delay policy.
///
/// The retryable predicate is [`DvsError::retry_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Delay growth.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Creates a fixed-delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Creates a policy that never retries.
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Returns the delay to apply after `attempt` failed attempts (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.initial_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Runs `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned on failure.
    pub async fn run<F, Fut, T>(&self, operation: &str, f: F) -> DvsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DvsResult<T>>,
    {
        let policy = *self;
        tryhard::retry_fn(f)
            .retries(self.max_attempts.saturating_sub(1))
            .custom_backoff(move |attempt, err: &DvsError| {
                match err.retry_delay(policy.delay_for(attempt)) {
                    Some(delay) => {
                        warn!(
                            operation,
                            attempt,
                            max_attempts = policy.max_attempts,
                            ?delay,
                            "transient failure, retrying: {}",
                            err
                        );
                        tryhard::RetryPolicy::Delay(delay)
                    }
                    None => tryhard::RetryPolicy::Break,
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_for() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(40));
        assert_eq!(fixed.delay_for(1), Duration::from_millis(40));
        assert_eq!(fixed.delay_for(7), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));

        let result = policy
            .run("book_port", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(DvsError::connection("book_port", "connection reset"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(4, Duration::from_millis(10));

        let result: DvsResult<()> = policy
            .run("release_port", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DvsError::ResourceInUse {
                    resource: "dvportgroup-7".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(DvsError::ResourceInUse { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_domain_error_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(10, Duration::from_millis(10));

        let result: DvsResult<()> = policy
            .run("create_network", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DvsError::no_dvs("physnet3"))
            })
            .await;

        assert!(matches!(
            result,
            Err(DvsError::NoDvsForPhysicalNetwork { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_modification_retried_immediately() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(3, Duration::from_secs(3600));

        let result = policy
            .run("update_network", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DvsError::ConcurrentModification {
                        operation: "update_network".to_string(),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
