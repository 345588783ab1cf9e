//! Retry policy with configurable backoff.
//!
//! Delays are deterministic and never decrease from one attempt to the
//! next, so the delay a job will wait is predictable from its attempt
//! count alone.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ErrorClass;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base
    Constant,
}

/// Per-stage retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Delay to wait after attempt `attempt` (1-indexed) failed.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;
        let n = attempt.max(1);

        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                let factor = 2u64.checked_pow(n - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(n)),
            BackoffStrategy::Constant => base,
        };

        Duration::from_millis(delay.min(max))
    }

    /// Returns true if `attempt` used the whole budget.
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Decides what to do after attempt `attempt` failed with `class`.
    #[must_use]
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        if class == ErrorClass::Terminal {
            return RetryDecision::NotRetryable;
        }
        if self.is_exhausted(attempt) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            next_attempt: attempt + 1,
            delay: self.delay_for_attempt(attempt),
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// The attempt number to run next.
        next_attempt: u32,
        /// How long to wait first.
        delay: Duration,
    },
    /// Attempt budget exhausted.
    GiveUp,
    /// The error is terminal.
    NotRetryable,
}

/// Executes an operation, retrying errors the predicate accepts.
pub async fn with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let class = if is_retryable(&e) {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Terminal
                };
                match policy.decide(attempt, class) {
                    RetryDecision::Retry { next_attempt, delay } => {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "Retrying after error"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next_attempt;
                    }
                    RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::new().with_base_delay_ms(5000).with_max_delay_ms(60_000);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(20_000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(40_000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(60_000));
    }

    #[test]
    fn test_delays_are_clamped_and_non_decreasing() {
        for backoff in [
            BackoffStrategy::Exponential,
            BackoffStrategy::Linear,
            BackoffStrategy::Constant,
        ] {
            let policy = RetryPolicy::new()
                .with_base_delay_ms(2000)
                .with_max_delay_ms(30_000)
                .with_backoff(backoff);

            let mut previous = Duration::ZERO;
            for attempt in 1..=80 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay >= previous, "{backoff:?} decreased at attempt {attempt}");
                assert!(delay <= Duration::from_millis(30_000));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let constant = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.delay_for_attempt(7), Duration::from_millis(100));
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::new().with_max_attempts(3).with_base_delay_ms(10);

        assert_eq!(
            policy.decide(1, ErrorClass::Retryable),
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            policy.decide(2, ErrorClass::Retryable),
            RetryDecision::Retry {
                next_attempt: 3,
                delay: Duration::from_millis(20)
            }
        );
        assert_eq!(policy.decide(3, ErrorClass::Retryable), RetryDecision::GiveUp);
        assert_eq!(policy.decide(1, ErrorClass::Terminal), RetryDecision::NotRetryable);
    }

    #[test]
    fn test_next_attempt_never_exceeds_budget() {
        let policy = RetryPolicy::new().with_max_attempts(4);
        for attempt in 1..=10 {
            if let RetryDecision::Retry { next_attempt, .. } = policy.decide(attempt, ErrorClass::Retryable) {
                assert!(next_attempt <= policy.max_attempts);
            }
        }
    }

    #[test]
    fn test_policy_serde() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 5, "base_delay_ms": 200, "max_delay_ms": 1000}"#,
        )
        .unwrap();
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert_eq!(policy.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_with_retry_success_after_failures() {
        let policy = RetryPolicy::new().with_max_attempts(5).with_base_delay_ms(1);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<u32, String> = with_retry(&policy, "test", |_| true, || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_at_budget() {
        let policy = RetryPolicy::new().with_max_attempts(3).with_base_delay_ms(1);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), String> = with_retry(&policy, "test", |_| true, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("always fails".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_skips_terminal_errors() {
        let policy = RetryPolicy::new().with_max_attempts(5).with_base_delay_ms(1);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), String> = with_retry(&policy, "test", |_| false, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
