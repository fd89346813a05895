//! Typed error hierarchy for the provisioning orchestrator.
//!
//! Four enums cover the subsystems:
//! - `StepError`: what a step body reports; classified at the step boundary
//! - `StoreError`: checkpoint store persistence failures
//! - `ManifestError`: manifest loading and validation failures
//! - `OrchestratorError`: infrastructure failures of the control loop itself

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised inside a step body.
///
/// The orchestrator never sees these raw: the step boundary converts them into
/// `StepOutcome::Failed` with `retryable` set from the variant.
#[derive(Debug, Error)]
pub enum StepError {
    /// Retryable within the step's attempt budget (locked file, service still starting).
    #[error("{0}")]
    Transient(String),

    /// Not retryable (unsupported OS, missing prerequisite).
    #[error("{0}")]
    Permanent(String),
}

impl StepError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("State file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("No checkpoint recorded for step '{0}'")]
    UnknownStep(String),
}

impl StoreError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Errors from reading or validating a step manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Manifest declares no steps")]
    Empty,

    #[error("Step at position {index} has an empty id")]
    EmptyId { index: usize },

    #[error("Step id '{0}' is declared more than once")]
    DuplicateId(String),

    #[error("Step '{step}' is invalid: {message}")]
    Invalid { step: String, message: String },
}

/// Infrastructure errors from the control loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to schedule resume: {0}")]
    Reboot(String),

    #[error("Another orchestrator holds the run lock at {path}")]
    Locked { path: PathBuf },

    #[error("Failed to acquire run lock at {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    /// True when the underlying cause is an unreadable state file.
    pub fn is_store_corrupt(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_corrupt())
    }
}
