//! Retry policy for failed batch items

use std::time::Duration;

use crate::environment::RuntimeEnvironment;

/// Exponential backoff between batch passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total passes, including the first
    pub max_attempts: u32,
    /// Delay before the second pass
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for an environment. Constrained serverless hosts never retry:
    /// the remaining time is better spent on fresh items.
    pub fn for_environment(
        environment: RuntimeEnvironment,
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        let max_attempts = if environment.is_constrained() {
            1
        } else {
            max_attempts.max(1)
        };
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay after a failed `attempt` (1-based): base doubled per attempt, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
