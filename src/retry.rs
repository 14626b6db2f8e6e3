//! Exponential backoff with jitter, and timeout-bounded retries for idempotent broker reads.
//!
//! Order submission does not use `with_retry`: resubmitting is only safe after re-querying order
//! state, which the executor handles itself.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

use crate::config::ExecParams;
use crate::error::{BrokerError, StrategyError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// ±fraction applied to each delay.
    pub jitter_factor: f64,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ExecParams::default())
    }
}

impl From<&ExecParams> for RetryPolicy {
    fn from(p: &ExecParams) -> Self {
        Self {
            max_attempts: p.max_attempts,
            initial_backoff: Duration::from_millis(p.initial_backoff_ms),
            max_backoff: Duration::from_millis(p.max_backoff_ms),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            call_timeout: p.call_timeout(),
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            initial_ms: policy.initial_backoff.as_millis() as u64,
            max_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.backoff_multiplier,
            jitter: policy.jitter_factor,
        }
    }

    /// Delay before the next retry: initial × multiplier^n, jittered, capped at max.
    pub fn next_delay(&mut self) -> Duration {
        let base = (self.initial_ms as f64 * self.multiplier.powi(self.attempt as i32)) as u64;
        let base = base.min(self.max_ms);
        self.attempt += 1;
        let spread = base as f64 * self.jitter;
        let ms = if spread > 0.0 {
            let lo = (base as f64 - spread).max(0.0);
            rand::rng().random_range(lo..=base as f64 + spread) as u64
        } else {
            base
        };
        Duration::from_millis(ms.min(self.max_ms))
    }
}

/// Run one broker call under the policy timeout. An elapsed timeout maps to `BrokerError::Timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(BrokerError::Timeout(timeout.as_secs())),
    }
}

/// Retry an idempotent read on transient errors and timeouts.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> Result<T, StrategyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut backoff = Backoff::new(policy);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match with_timeout(policy.call_timeout, call()).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff.next_delay();
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    op, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                return Err(StrategyError::RetriesExhausted {
                    op: op.to_string(),
                    attempts: attempt,
                    last_error: e.to_string(),
                })
            }
            Err(e) => return Err(StrategyError::broker(op, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            call_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff::new(&RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            jitter_factor: 0.0,
            ..fast_policy(5)
        });
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_in_band() {
        let mut b = Backoff::new(&RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            jitter_factor: 0.2,
            ..fast_policy(5)
        });
        let d = b.next_delay().as_millis();
        assert!((80..=120).contains(&d), "{d}");
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast_policy(3), "price", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::Transient("503".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_bound() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast_policy(2), "chain", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(BrokerError::Transient("reset".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StrategyError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast_policy(5), "position", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(BrokerError::NotFound("AAPL".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StrategyError::Broker { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..fast_policy(1)
        };
        let err = with_retry(&policy, "slow", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, BrokerError>(1)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StrategyError::RetriesExhausted { .. }));
    }
}
