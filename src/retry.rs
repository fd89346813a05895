//! Retry/backoff policy.
//!
//! Provisioning steps are short-lived local OS operations, so the delay grows
//! linearly with the attempt number and is capped, rather than exponential.

use crate::step::StepOutcome;
use std::time::Duration;

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Linear backoff: `base_delay * attempt`, never more than `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_secs(5), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Decide whether to retry after `attempt` (1-based) produced `outcome`.
    ///
    /// Only retryable failures are retried, and only while
    /// `attempt < max_attempts`. Reboots, successes, skips and permanent
    /// failures always give up.
    pub fn decide(&self, attempt: u32, max_attempts: u32, outcome: &StepOutcome) -> RetryDecision {
        if !outcome.is_retryable_failure() || attempt >= max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }

    /// Delay before the attempt following `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(attempt.max(1))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
