use crate::checkpoint::StateFile;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Exit code when the state file cannot be parsed.
pub const EXIT_STORE_CORRUPT: u8 = 3;

/// Why a run stopped without finishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FatalReason {
    /// A required step failed permanently or ran out of attempts.
    StepFailed {
        step_id: String,
        reason: String,
        attempts: u32,
    },
    /// Another reboot was requested after `max_cycles` resumes.
    CycleBudgetExhausted {
        step_id: String,
        cycles: u32,
        max_cycles: u32,
    },
}

impl FatalReason {
    pub fn step_id(&self) -> &str {
        match self {
            Self::StepFailed { step_id, .. } | Self::CycleBudgetExhausted { step_id, .. } => {
                step_id
            }
        }
    }
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepFailed {
                step_id,
                reason,
                attempts,
            } => write!(
                f,
                "step '{}' failed after {} attempt(s): {}",
                step_id, attempts, reason
            ),
            Self::CycleBudgetExhausted {
                step_id,
                cycles,
                max_cycles,
            } => write!(
                f,
                "step '{}' requested a reboot in cycle {} but the budget is {} cycle(s)",
                step_id, cycles, max_cycles
            ),
        }
    }
}

/// Terminal state of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step is Success or Skipped.
    Done,
    /// Resume was scheduled; the process should exit and let the host restart.
    AwaitingReboot { step_id: String, next_cycle: u32 },
    Fatal { reason: FatalReason },
    /// Stopped between steps on request.
    Cancelled,
}

impl RunOutcome {
    pub fn fatal(reason: FatalReason) -> Self {
        Self::Fatal { reason }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Done => 0,
            Self::Fatal { .. } => 1,
            Self::AwaitingReboot { .. } => 2,
            Self::Cancelled => 4,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::AwaitingReboot {
                step_id,
                next_cycle,
            } => write!(
                f,
                "awaiting reboot after '{}' (resume as cycle {})",
                step_id, next_cycle
            ),
            Self::Fatal { reason } => write!(f, "fatal: {}", reason),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a finished run hands to the reporter.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: StateFile,
    pub elapsed: Duration,
}
