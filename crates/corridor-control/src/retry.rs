// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backoff and bounded polling.
//!
//! [`RetryPolicy`] retries a remote call while its error is transient, sleeping
//! `min(cap, base * 2^attempt) * uniform(0.5, 1.0)` between attempts.
//! [`PollConfig`] describes a bounded wait loop: how often to look and how
//! many looks before giving up.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::platform::{PlatformError, PlatformResult};

/// Capped exponential backoff with jitter for transient remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never below 1.
    pub max_attempts: u32,
    /// Delay before the first retry, before jitter.
    pub base: Duration,
    /// Upper bound of any delay, before jitter.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap,
        }
    }

    /// Same delays, different attempt budget.
    pub fn with_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// Delay ceiling after the given failed attempt (0-based), before jitter.
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    /// Jittered delay after the given failed attempt (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        self.ceiling_for_attempt(attempt).mul_f64(factor)
    }

    /// Run `call` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// Only transient errors are retried. The last error is returned as is.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> PlatformResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PlatformResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether a failed call is worth another attempt.
pub fn is_retryable(error: &PlatformError) -> bool {
    error.is_transient()
}

/// A bounded polling loop: look every `interval`, at most `max_attempts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Sleep between looks.
    pub interval: Duration,
    /// Looks before giving up.
    pub max_attempts: u32,
}

impl PollConfig {
    /// Create a poll configuration.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Poll every `interval` until `ceiling` has passed.
    pub fn within(interval: Duration, ceiling: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = ceiling.as_millis().div_ceil(interval_ms).max(1);
        Self {
            interval,
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let policy = policy(5);
        assert_eq!(policy.ceiling_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.ceiling_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.ceiling_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.ceiling_for_attempt(4), Duration::from_secs(1));
        assert_eq!(policy.ceiling_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_jitter_bounds() {
        let policy = policy(5);
        for attempt in 0..6 {
            let ceiling = policy.ceiling_for_attempt(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling / 2);
            }
        }
    }

    #[test]
    fn test_attempts_clamped_to_one() {
        assert_eq!(policy(0).max_attempts, 1);
        assert_eq!(policy(3).with_attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_poll_within() {
        let poll = PollConfig::within(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(poll.max_attempts, 60);
        let poll = PollConfig::within(Duration::from_secs(7), Duration::from_secs(10));
        assert_eq!(poll.max_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy(4)
            .run("describe", || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(PlatformError::api("ThrottlingException", "Rate exceeded"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: PlatformResult<()> = policy(3)
            .run("describe", || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(PlatformError::Timeout(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(result, Err(PlatformError::Timeout("attempt 2".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: PlatformResult<()> = policy(5)
            .run("create", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(PlatformError::api("InvalidParameterException", "bad")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_classification() {
        assert!(is_retryable(&PlatformError::Connection("reset".into())));
        assert!(is_retryable(&PlatformError::api("InternalFailure", "")));
        assert!(is_retryable(&PlatformError::api("ServiceUnavailable", "")));
        assert!(!is_retryable(&PlatformError::api("AccessDeniedException", "")));
        assert!(!is_retryable(&PlatformError::NotFound("svc".into())));
        assert!(!is_retryable(&PlatformError::AlreadyExists("svc".into())));
    }
}
