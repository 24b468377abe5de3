//! Retry decisions and backoff delays for task invocations.
//!
//! Stateless: every function takes the policy and attempt number it needs.

use std::time::Duration;

use loom_types::workflow::{BackoffStrategy, RetryPolicy};

use super::invoker::InvocationError;

pub struct RetryHandler;

impl RetryHandler {
    /// Whether a failed attempt should be followed by another.
    ///
    /// `attempt` is 1-based; a policy with `max_retries = 2` allows attempts 1..=3.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &InvocationError) -> bool {
        attempt <= policy.max_retries && error.is_retryable()
    }

    /// Delay before attempt `attempt + 1`, capped at `max_delay_ms`.
    pub fn delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = policy.initial_delay_ms;
        let ms = match policy.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(policy.max_delay_ms))
    }
}
