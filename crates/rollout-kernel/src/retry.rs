//! Retry/backoff executor
//!
//! Wraps a fallible remote operation with a bounded number of attempts and a
//! linear backoff: after the n-th failure the executor sleeps
//! `n * base_delay` before trying again. There is no sleep after the last
//! attempt and no deduplication, so the wrapped operation must tolerate being
//! invoked more than once.

use crate::error::DeployError;
use crate::remote::RemoteError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Attempt budget and backoff step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first; 0 is treated as 1
    pub max_attempts: u32,
    /// Backoff step; the delay after attempt n is `n * base_delay`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Policy that tries once and never sleeps
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Effective number of attempts
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay slept after failed attempt number `attempt` (1-based)
    #[inline]
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Run `op` until it succeeds or the policy's attempt budget is spent
///
/// `label` names the operation in logs and in the final error.
///
/// # Errors
/// [`DeployError::RetryExhausted`] carrying the last remote error.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, DeployError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(label, attempt, "remote call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt >= attempts => {
                tracing::warn!(label, attempts, %error, "retry budget exhausted");
                return Err(DeployError::RetryExhausted {
                    label: label.to_string(),
                    attempts,
                    source: error,
                });
            }
            Err(error) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    label,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "remote call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
