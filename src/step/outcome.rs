use crate::errors::StepError;
use serde::{Deserialize, Serialize};

/// Category of provisioning work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Detect,
    #[default]
    Install,
    Configure,
    Verify,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Detect => write!(f, "detect"),
            StepKind::Install => write!(f, "install"),
            StepKind::Configure => write!(f, "configure"),
            StepKind::Verify => write!(f, "verify"),
        }
    }
}

impl std::str::FromStr for StepKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "detect" => Ok(StepKind::Detect),
            "install" => Ok(StepKind::Install),
            "configure" => Ok(StepKind::Configure),
            "verify" => Ok(StepKind::Verify),
            _ => anyhow::bail!(
                "Invalid step kind '{}'. Valid values: detect, install, configure, verify",
                s
            ),
        }
    }
}

/// Result of a single step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed { reason: String, retryable: bool },
    RebootRequired,
    Skipped { reason: String },
}

impl StepOutcome {
    pub fn failed(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Failed {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    /// Success and Skipped end a step for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, Self::Failed { retryable: true, .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed { .. } => "failed",
            Self::RebootRequired => "reboot-required",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason, .. } | Self::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

impl From<StepError> for StepOutcome {
    fn from(err: StepError) -> Self {
        let retryable = err.is_retryable();
        StepOutcome::failed(err.to_string(), retryable)
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{} ({})", self.label(), reason),
            None => write!(f, "{}", self.label()),
        }
    }
}
