//! Restart policy with exponential backoff.
//!
//! The RPC client never retries on its own; whether a timed-out or refused
//! call is worth repeating is the caller's decision. Retrying lives here for
//! the consumer bootstrap: [`Supervisor`](crate::Supervisor) re-attempts a
//! consumer start that failed because the broker was unreachable.
//!
//! - Only errors for which [`RpcError::is_retryable`] holds are retried.
//! - Delays grow by `multiplier` per attempt, capped at `max_delay`.
//! - Each delay is jittered by ±25% so restarting services do not
//!   reconnect in lockstep.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use tokio::time::sleep;

use crate::{log_debug, log_warn, Result, RpcError};

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Number of retries after the first attempt (0 = single attempt).
    pub max_attempts: u32,

    /// Factor applied to the delay after each retry.
    pub multiplier: f32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// Three retries: 200ms, 400ms, 800ms (before jitter), capped at 5s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = retry.saturating_sub(1) as i32;
        let factor = f64::from(self.multiplier).powi(exponent);
        let delay = self.initial_delay.as_secs_f64() * factor;

        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

/// Run `operation`, retrying retryable failures according to `policy`.
///
/// `label` names the operation in log lines.
///
/// # Returns
///
/// - `Ok(T)` from the first successful attempt.
/// - The last error once retries are exhausted, or the first
///   non-retryable error immediately.
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryConfig,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retry < policy.max_attempts => {
                retry += 1;
                let delay = apply_jitter(policy.backoff(retry));

                log_warn!(
                    "{label}: attempt {} failed ({err}), retry {retry}/{} in {delay:?}",
                    retry,
                    policy.max_attempts
                );

                sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    log_debug!("{label}: giving up after {} retries", policy.max_attempts);
                }
                return Err(err);
            }
        }
    }
}

/// Apply ±25% jitter to a duration.
fn apply_jitter(delay: Duration) -> Duration {
    let hash = RandomState::new().hash_one(std::time::SystemTime::now());
    let random_factor = (hash % 1000) as f64 / 1000.0;

    Duration::from_secs_f64(delay.as_secs_f64() * (0.75 + random_factor * 0.5))
}
