//! Capped exponential-backoff retry.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::Result;

/// Backoff schedule: attempt n sleeps `base × 2^(n-1)`, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Generic retry loop over a fallible async operation.
///
/// Stops immediately on a non-retryable error or on the final attempt; a
/// retryable error's `retry_after` hint overrides the computed backoff.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn execute<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.retryable || attempt >= self.policy.max_attempts => {
                    if err.retryable {
                        warn!(label, attempt, code = %err.code, "retry budget exhausted");
                    }
                    return Err(err);
                }
                Err(err) => {
                    let delay = err
                        .retry_after
                        .unwrap_or_else(|| self.policy.delay_for_attempt(attempt));
                    warn!(
                        label,
                        attempt,
                        code = %err.code,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(30_000),
            8,
        );

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_respects_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(30), 8);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let executor = RetryExecutor::new(RetryPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            5,
        ));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result = executor
            .execute("flaky", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::system("TRANSIENT", "busy"))
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
    async fn test_non_retryable_stops_immediately() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = executor
            .execute("invalid", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::validation("BAD_INPUT", "nope"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_attempt_surfaces_error() {
        let executor = RetryExecutor::new(RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
            3,
        ));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = executor
            .execute("down", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::system("DOWN", "still down"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().code, "DOWN");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
