//! Step model: the unit of provisioning work and the outcome it produces.
//!
//! A [`Step`] has a stable identity, a side-effect-free idempotency check, and an
//! execution function. Concrete steps are usually [`DescriptorStep`]s built from
//! a manifest entry; tests and embedders can implement the trait directly.

pub mod descriptor;
pub mod download;
pub mod outcome;
pub mod probe;
pub mod process;

pub use descriptor::{DescriptorStep, StepEnv};
pub use outcome::{StepKind, StepOutcome};

use crate::errors::StepError;
use async_trait::async_trait;
use std::time::Duration;

/// Default child-process timeout when a manifest entry does not set one.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// One idempotent unit of provisioning work.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable, unique identity. Must not change across process restarts.
    fn id(&self) -> &str;

    fn kind(&self) -> StepKind;

    /// Attempts allowed for retryable failures before giving up.
    fn max_attempts(&self) -> u32;

    /// Whether a successful execution must be followed by a host restart.
    fn requires_reboot_after(&self) -> bool {
        false
    }

    /// Optional steps are recorded as `Skipped` instead of failing the run.
    fn optional(&self) -> bool {
        false
    }

    /// Probe whether the desired end state already holds.
    ///
    /// Must have no side effects: calling it any number of times in a row
    /// returns the same answer.
    async fn idempotent_check(&self) -> Result<bool, StepError>;

    /// Apply the step. Called only when the idempotent check is false, and
    /// must tolerate re-running after a partial application.
    async fn execute(&self) -> Result<StepOutcome, StepError>;
}

/// Short human description used in logs: `install:install-cloudwatch`.
pub fn describe(step: &dyn Step) -> String {
    format!("{}:{}", step.kind(), step.id())
}
