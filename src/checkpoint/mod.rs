//! Durable, host-local checkpoint state.
//!
//! The state file is the single source of truth read on every resume. It holds
//! one [`Checkpoint`] per step, the active [`CycleRecord`], past cycles, and the
//! [`ResumeMarker`] written just before a reboot is scheduled.

pub mod lock;
pub mod store;

pub use lock::RunLock;
pub use store::CheckpointStore;

use crate::step::StepOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// On-disk format version. Any other value is treated as corrupt.
pub const STATE_VERSION: u32 = 1;

/// Persisted record of one step's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step_id: String,
    /// Total attempts across all cycles, including interrupted ones.
    pub attempts_made: u32,
    /// Failed attempts since the last non-failure outcome; drives the retry budget.
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<StepOutcome>,
    /// Set once the step reached Success or Skipped. Never cleared except by reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Resolved by the idempotent check without calling `execute`.
    #[serde(default)]
    pub satisfied_by_check: bool,
    /// An attempt started and was never recorded (crash or forced reboot).
    #[serde(default)]
    pub in_flight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Accumulated execution time across attempts.
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Cycle in which the last attempt ran.
    #[serde(default)]
    pub cycle: u32,
}

impl Checkpoint {
    pub fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            attempts_made: 0,
            consecutive_failures: 0,
            last_outcome: None,
            completed_at: None,
            satisfied_by_check: false,
            in_flight: false,
            first_started_at: None,
            last_attempt_at: None,
            elapsed_ms: 0,
            cycle: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One reboot-to-reboot span of orchestrator execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// 0 for the first invocation; incremented on every resume after a reboot.
    pub cycle_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub steps_attempted: Vec<String>,
}

impl CycleRecord {
    pub fn new(cycle_number: u32) -> Self {
        Self {
            cycle_number,
            started_at: Utc::now(),
            steps_attempted: Vec::new(),
        }
    }
}

/// Written before the resume trigger is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMarker {
    /// Cycle that requested the reboot; the resumed run is `cycle_number + 1`.
    pub cycle_number: u32,
    pub after_step: String,
    pub scheduled_at: DateTime<Utc>,
    /// Whether a resume trigger was registered with the OS.
    #[serde(default)]
    pub trigger_registered: bool,
    #[serde(default)]
    pub restart_requested: bool,
}

/// Complete persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    /// Host name when the file was last written. Informational once a
    /// machine id is recorded.
    pub host: String,
    /// Stable machine identity; survives a computer rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cycle: CycleRecord,
    #[serde(default)]
    pub cycle_history: Vec<CycleRecord>,
    #[serde(default)]
    pub checkpoints: BTreeMap<String, Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeMarker>,
}

impl StateFile {
    pub fn new(host: &str) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            host: host.to_string(),
            machine_id: None,
            created_at: now,
            updated_at: now,
            cycle: CycleRecord::new(0),
            cycle_history: Vec::new(),
            checkpoints: BTreeMap::new(),
            resume: None,
        }
    }

    pub fn checkpoint(&self, step_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(step_id)
    }

    fn checkpoint_mut(&mut self, step_id: &str) -> &mut Checkpoint {
        self.checkpoints
            .entry(step_id.to_string())
            .or_insert_with(|| Checkpoint::new(step_id))
    }
}

/// Who this host is, as far as the state file is concerned.
///
/// The machine id is what ties a state file to a host. The name is only
/// compared when either side has no machine id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub machine_id: Option<String>,
    pub host_name: String,
}

impl HostIdentity {
    /// Identity of the running host.
    pub fn current() -> Self {
        Self {
            machine_id: read_machine_id(),
            host_name: current_host(),
        }
    }

    /// Identity with a name only.
    #[cfg(test)]
    pub fn named(host_name: &str) -> Self {
        Self {
            machine_id: None,
            host_name: host_name.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_machine_id(mut self, machine_id: &str) -> Self {
        self.machine_id = Some(machine_id.to_string());
        self
    }

    /// Whether `state` was written by this host.
    pub fn owns(&self, state: &StateFile) -> bool {
        match (&self.machine_id, &state.machine_id) {
            (Some(ours), Some(theirs)) => ours.eq_ignore_ascii_case(theirs),
            _ => state.host.eq_ignore_ascii_case(&self.host_name),
        }
    }

    /// Stamp this identity onto `state`.
    pub fn apply(&self, state: &mut StateFile) {
        state.host = self.host_name.clone();
        if self.machine_id.is_some() {
            state.machine_id = self.machine_id.clone();
        }
    }
}

/// Best-effort host name, for display and as a fallback identity.
pub fn current_host() -> String {
    for var in ["COMPUTERNAME", "HOSTNAME"] {
        if let Ok(name) = std::env::var(var)
            && !name.trim().is_empty()
        {
            return name.trim().to_string();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// `HKLM\SOFTWARE\Microsoft\Cryptography\MachineGuid` on Windows,
/// `/etc/machine-id` elsewhere.
pub fn read_machine_id() -> Option<String> {
    if cfg!(windows) {
        let output = std::process::Command::new("reg.exe")
            .args([
                "query",
                r"HKLM\SOFTWARE\Microsoft\Cryptography",
                "/v",
                "MachineGuid",
            ])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_reg_machine_guid(&String::from_utf8_lossy(&output.stdout))
    } else {
        ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .filter_map(|path| std::fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
    }
}

/// Value of the `MachineGuid` line in `reg query` output.
pub fn parse_reg_machine_guid(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("MachineGuid"))
        .and_then(|line| line.split_whitespace().nth(2))
        .map(str::to_string)
}
