//! Timeout and bounded exponential backoff around broker calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::domain::error::SigtraderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-attempt deadline.
    pub timeout_ms: u64,
    pub max_attempts: u32,
    /// Delay after the first failed attempt; scales by `backoff_multiplier`
    /// up to `backoff_ms_max`.
    pub backoff_ms_initial: u64,
    pub backoff_multiplier: u32,
    pub backoff_ms_max: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout_ms: 5_000,
            max_attempts: 3,
            backoff_ms_initial: 250,
            backoff_multiplier: 2,
            backoff_ms_max: 4_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier).saturating_pow(retry.saturating_sub(1));
        let ms = self
            .backoff_ms_initial
            .saturating_mul(factor)
            .min(self.backoff_ms_max);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-broker error, or attempts
    /// run out. Each attempt is bounded by `timeout_ms`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, SigtraderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SigtraderError>>,
    {
        let attempts = self.max_attempts.max(1);
        let deadline = Duration::from_millis(self.timeout_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let error = match tokio::time::timeout(deadline, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_broker_error() => e,
                Ok(Err(e)) => return Err(e),
                Err(_) => SigtraderError::BrokerTimeout {
                    operation: operation.to_string(),
                    timeout_ms: self.timeout_ms,
                },
            };

            warn!(operation, attempt, max_attempts = attempts, %error, "broker call failed");
            last_error = error.to_string();

            if attempt < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(SigtraderError::BrokerExhausted {
            operation: operation.to_string(),
            attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            timeout_ms: 50,
            max_attempts,
            backoff_ms_initial: 1,
            backoff_multiplier: 2,
            backoff_ms_max: 4,
        }
    }

    fn unavailable() -> SigtraderError {
        SigtraderError::BrokerUnavailable {
            operation: "open".into(),
            reason: "connection reset".into(),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            backoff_ms_initial: 100,
            backoff_multiplier: 3,
            backoff_ms_max: 1_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(300));
        assert_eq!(policy.backoff(3), Duration::from_millis(900));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast_policy(3)
            .run("open", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(unavailable())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast_policy(2)
            .run("close", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(unavailable())
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(SigtraderError::BrokerExhausted { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<(), _> = fast_policy(1)
            .run("open", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;
        match result {
            Err(SigtraderError::BrokerExhausted { last_error, .. }) => {
                assert!(last_error.contains("timed out"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_broker_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast_policy(5)
            .run("open", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SigtraderError::Invariant {
                        reason: "bad".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(SigtraderError::Invariant { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
