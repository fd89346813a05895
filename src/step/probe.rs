//! Side-effect-free probes used as idempotency checks and post-install
//! verification.
//!
//! Probes only ever query the host: `sc query`, `systemctl is-active`, a path
//! lookup, or a caller-supplied read-only command.

use super::process::{ProcessResult, ProcessSpec, run_process};
use crate::errors::StepError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// `sc query` exit code for "The specified service does not exist".
const SC_SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// `systemctl` exit code for "no such unit".
const SYSTEMCTL_NO_SUCH_UNIT: i32 = 4;

/// Desired service state for a service probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Running,
    Stopped,
    /// Present in any state.
    Installed,
}

/// Observed state of a service on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    Other(String),
}

impl ServiceState {
    fn satisfies(&self, want: ServiceStatus) -> bool {
        match want {
            ServiceStatus::Installed => true,
            ServiceStatus::Running => *self == ServiceState::Running,
            ServiceStatus::Stopped => *self == ServiceState::Stopped,
        }
    }
}

/// A read-only check against the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Probe {
    Service {
        name: String,
        #[serde(default)]
        status: ServiceStatus,
    },
    Path {
        path: PathBuf,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        expect_code: i32,
    },
}

impl Probe {
    /// Evaluate the probe. Errors mean "could not tell", not "does not hold".
    pub async fn holds(&self) -> Result<bool, StepError> {
        match self {
            Probe::Service { name, status } => {
                let state = query_service(name).await?;
                Ok(state.is_some_and(|s| s.satisfies(*status)))
            }
            Probe::Path { path } => Ok(path.exists()),
            Probe::Command {
                program,
                args,
                expect_code,
            } => {
                let spec = ProcessSpec::new(program.clone(), args.clone(), PROBE_TIMEOUT);
                match run_process(&spec, None).await? {
                    ProcessResult::Exited { code, .. } => Ok(code == *expect_code),
                    ProcessResult::TimedOut { .. } => Err(StepError::transient(format!(
                        "Probe command timed out: {}",
                        spec.display()
                    ))),
                }
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Probe::Service { name, status } => format!("service {} is {:?}", name, status),
            Probe::Path { path } => format!("path {} exists", path.display()),
            Probe::Command {
                program,
                args,
                expect_code,
            } => format!("`{} {}` exits {}", program, args.join(" "), expect_code),
        }
    }
}

/// Evaluate every probe; all must hold. An empty list does not hold.
pub async fn all_hold(probes: &[Probe]) -> Result<bool, StepError> {
    if probes.is_empty() {
        return Ok(false);
    }
    for probe in probes {
        if !probe.holds().await? {
            tracing::debug!(probe = %probe.describe(), "probe does not hold");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Query a service's state. `None` means the service is not installed.
async fn query_service(name: &str) -> Result<Option<ServiceState>, StepError> {
    if cfg!(windows) {
        let spec = ProcessSpec::new(
            "sc.exe",
            vec!["query".to_string(), name.to_string()],
            PROBE_TIMEOUT,
        );
        match run_process(&spec, None).await? {
            ProcessResult::Exited { code, .. } if code == SC_SERVICE_DOES_NOT_EXIST => Ok(None),
            ProcessResult::Exited { stdout, .. } => Ok(parse_sc_state(&stdout)),
            ProcessResult::TimedOut { .. } => {
                Err(StepError::transient(format!("sc query {} timed out", name)))
            }
        }
    } else {
        let spec = ProcessSpec::new(
            "systemctl",
            vec!["is-active".to_string(), name.to_string()],
            PROBE_TIMEOUT,
        );
        match run_process(&spec, None).await? {
            ProcessResult::Exited { code, .. } if code == SYSTEMCTL_NO_SUCH_UNIT => Ok(None),
            ProcessResult::Exited { stdout, .. } => Ok(parse_systemctl_state(&stdout)),
            ProcessResult::TimedOut { .. } => {
                Err(StepError::transient(format!("systemctl is-active {} timed out", name)))
            }
        }
    }
}

static SC_STATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"STATE\s*:\s*\d+\s+([A-Z_]+)").unwrap());

/// Parse the `STATE` line of `sc query` output.
pub fn parse_sc_state(output: &str) -> Option<ServiceState> {
    let caps = SC_STATE_REGEX.captures(output)?;
    Some(match &caps[1] {
        "RUNNING" => ServiceState::Running,
        "STOPPED" => ServiceState::Stopped,
        other => ServiceState::Other(other.to_string()),
    })
}

/// Parse `systemctl is-active` output. `unknown` means no such unit on older
/// systemd versions that exit 3 instead of 4.
pub fn parse_systemctl_state(output: &str) -> Option<ServiceState> {
    match output.trim() {
        "" | "unknown" => None,
        "active" => Some(ServiceState::Running),
        "inactive" | "failed" => Some(ServiceState::Stopped),
        other => Some(ServiceState::Other(other.to_string())),
    }
}
