//! Bounded exponential backoff for provider calls.
//!
//! Retryable errors (throttling, transient network faults) are retried
//! inside the node's own operation and never surface past the scheduler
//! unless the attempt budget runs out. Permanent errors return immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::NodeFailure;
use crate::metrics::FlowMetrics;
use crate::provider::{ProviderError, ProviderResult};

/// Default number of attempts per provider call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
/// Default cap on a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
/// Default upper bound on random jitter added to each delay.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on the exponential delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Upper bound of uniform random jitter added to each delay.
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        backoff + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        let max = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// A provider call that failed for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    /// The last error returned.
    pub error: ProviderError,
    /// Attempts made.
    pub attempts: u32,
    /// True if a retryable error outlived the attempt budget.
    pub exhausted: bool,
}

impl RetryFailure {
    /// Converts into the failure recorded on the node.
    #[must_use]
    pub fn into_node_failure(self) -> NodeFailure {
        NodeFailure::Provider {
            retryable: self.error.is_retryable(),
            message: self.error.message,
            attempts: self.attempts,
            retries_exhausted: self.exhausted,
        }
    }
}

/// Runs `call` until it succeeds, fails permanently or runs out of attempts.
///
/// `call` receives the 1-based attempt number. Returns the value and the
/// number of attempts it took.
///
/// # Errors
///
/// Returns a [`RetryFailure`] with the last error.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    metrics: &FlowMetrics,
    operation: &str,
    mut call: F,
) -> Result<(T, u32), RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Ok(value) => {
                metrics.record_provider_call(operation, "success");
                return Ok((value, attempt));
            }
            Err(error) if !error.is_retryable() => {
                metrics.record_provider_call(operation, "permanent");
                tracing::warn!(operation, attempt, error = %error.message, "permanent provider error");
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    exhausted: false,
                });
            }
            Err(error) => {
                metrics.record_provider_call(operation, "retryable");
                if attempt >= max_attempts {
                    tracing::warn!(operation, attempts = attempt, error = %error.message, "retry budget exhausted");
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        exhausted: true,
                    });
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!(operation, attempt, ?delay, error = %error.message, "retrying provider call");
                metrics.record_retry(operation);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
