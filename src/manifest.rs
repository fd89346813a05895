//! Step manifest loading and validation.
//!
//! A manifest is TOML (`.toml`) or JSON (anything else) with an optional
//! `[settings]` table and an ordered `[[steps]]` list. Declared order is
//! execution order.

use crate::config::Settings;
use crate::errors::ManifestError;
use crate::step::StepKind;
use crate::step::download::DownloadDescriptor;
use crate::step::probe::Probe;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Placeholder in install arguments replaced with the downloaded file path.
pub const DOWNLOAD_PLACEHOLDER: &str = "{download}";

/// Installer or command invocation and how to read its exit code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationDescriptor {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
    /// Success that needs a restart (MSI 3010, 1641).
    #[serde(default = "default_reboot_codes")]
    pub reboot_codes: Vec<i32>,
    /// Failures worth retrying (MSI 1618: another installation in progress).
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

fn default_reboot_codes() -> Vec<i32> {
    vec![3010, 1641]
}

fn default_retryable_codes() -> Vec<i32> {
    vec![1618]
}

/// How an installer exit code is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    RebootRequired,
    Retryable,
    Failure,
}

impl InvocationDescriptor {
    pub fn classify(&self, code: i32) -> ExitClass {
        if self.success_codes.contains(&code) {
            ExitClass::Success
        } else if self.reboot_codes.contains(&code) {
            ExitClass::RebootRequired
        } else if self.retryable_codes.contains(&code) {
            ExitClass::Retryable
        } else {
            ExitClass::Failure
        }
    }

    /// Arguments with the download placeholder substituted.
    pub fn resolved_args(&self, download: Option<&Path>) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match download {
                Some(path) => arg.replace(DOWNLOAD_PLACEHOLDER, &path.to_string_lossy()),
                None => arg.clone(),
            })
            .collect()
    }

    fn uses_download(&self) -> bool {
        self.args.iter().any(|a| a.contains(DOWNLOAD_PLACEHOLDER))
            || self.program.contains(DOWNLOAD_PLACEHOLDER)
    }
}

/// One `[[steps]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Failure after the attempt budget is recorded as Skipped.
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub requires_reboot_after: bool,
    /// Idempotency probes; all must hold for the step to count as done.
    #[serde(default)]
    pub check: Vec<Probe>,
    /// When this holds the step is skipped as not applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_when: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadDescriptor>,
    #[serde(default, alias = "command", skip_serializing_if = "Option::is_none")]
    pub install: Option<InvocationDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<Probe>,
    /// How long to poll `verify` after a successful install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_timeout_secs: Option<u64>,
}

/// Parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl Manifest {
    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let manifest = if is_toml {
            Self::parse_toml(&content)
        } else {
            Self::parse_json(&content)
        }
        .map_err(|reason| ManifestError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn parse_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    pub fn parse_json(content: &str) -> Result<Self, String> {
        serde_json::from_str(content).map_err(|e| e.to_string())
    }

    /// Check structural rules: unique non-empty ids, something to do per
    /// step, and consistent descriptors.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.steps.is_empty() {
            return Err(ManifestError::Empty);
        }
        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(ManifestError::EmptyId { index });
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ManifestError::DuplicateId(step.id.clone()));
            }
            let invalid = |message: &str| ManifestError::Invalid {
                step: step.id.clone(),
                message: message.to_string(),
            };
            if step.check.is_empty()
                && step.install.is_none()
                && step.verify.is_none()
                && step.skip_when.is_none()
            {
                return Err(invalid("needs at least one of check, install, verify, skip_when"));
            }
            if step.max_attempts == Some(0) {
                return Err(invalid("max_attempts must be at least 1"));
            }
            if step.timeout_secs == Some(0) {
                return Err(invalid("timeout_secs must be greater than 0"));
            }
            if let Some(ref install) = step.install {
                if install.program.trim().is_empty() {
                    return Err(invalid("install.program is empty"));
                }
                if install.uses_download() && step.download.is_none() {
                    return Err(invalid("install uses {download} but no download is declared"));
                }
            }
            if let Some(ref download) = step.download {
                if download.sources.is_empty() {
                    return Err(invalid("download.sources is empty"));
                }
                if step.install.is_none() {
                    return Err(invalid("download declared without an install to consume it"));
                }
            }
        }
        Ok(())
    }
}
