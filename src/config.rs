//! Run configuration.
//!
//! Settings are layered: manifest `[settings]` table → environment → CLI flags.
//! [`Settings`] is the serde view of the manifest table; [`RunConfig`] is the
//! resolved, validated configuration the orchestrator runs with.
//!
//! ```toml
//! [settings]
//! max_cycles = 5
//! max_attempts = 3
//! retry_base_delay_secs = 5
//! retry_max_delay_secs = 30
//!
//! [settings.reboot]
//! mode = "scheduled-task"
//! task_name = "orchestrate-resume"
//! restart = true
//! delay_secs = 10
//! ```

use crate::retry::RetryPolicy;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STATE_ENV: &str = "ORCHESTRATE_STATE";
pub const LOG_DIR_ENV: &str = "ORCHESTRATE_LOG_DIR";

/// How the orchestrator arranges to be re-invoked after a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebootMode {
    /// One-shot `schtasks` ONSTART task, deleted by the resumed run.
    ScheduledTask,
    /// `HKLM\...\RunOnce` value; Windows removes it when it fires.
    RunOnce,
    /// Register nothing and never restart; calling automation handles both.
    None,
}

impl Default for RebootMode {
    fn default() -> Self {
        if cfg!(windows) {
            RebootMode::ScheduledTask
        } else {
            RebootMode::None
        }
    }
}

impl std::fmt::Display for RebootMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebootMode::ScheduledTask => write!(f, "scheduled-task"),
            RebootMode::RunOnce => write!(f, "run-once"),
            RebootMode::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for RebootMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled-task" | "schtasks" => Ok(RebootMode::ScheduledTask),
            "run-once" | "runonce" => Ok(RebootMode::RunOnce),
            "none" => Ok(RebootMode::None),
            _ => bail!(
                "Invalid reboot mode '{}'. Valid values: scheduled-task, run-once, none",
                s
            ),
        }
    }
}

/// `[settings.reboot]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootSettings {
    #[serde(default)]
    pub mode: RebootMode,
    /// Scheduled task name or RunOnce value name.
    #[serde(default = "default_task_name")]
    pub task_name: String,
    /// Whether the orchestrator restarts the host itself.
    #[serde(default = "default_restart")]
    pub restart: bool,
    /// Seconds between issuing the restart and the host going down.
    #[serde(default = "default_restart_delay")]
    pub delay_secs: u32,
}

fn default_task_name() -> String {
    "orchestrate-resume".to_string()
}

fn default_restart() -> bool {
    true
}

fn default_restart_delay() -> u32 {
    10
}

impl Default for RebootSettings {
    fn default() -> Self {
        Self {
            mode: RebootMode::default(),
            task_name: default_task_name(),
            restart: default_restart(),
            delay_secs: default_restart_delay(),
        }
    }
}

/// `[settings]` table of a step manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Reboot-spanning cycles allowed before the run is fatal.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Default attempt budget for steps that don't set their own.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,
    /// Default per-step child-process timeout.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
    #[serde(default)]
    pub reboot: RebootSettings,
}

fn default_max_cycles() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    5
}

fn default_retry_max_delay() -> u64 {
    30
}

fn default_step_timeout() -> u64 {
    crate::step::DEFAULT_STEP_TIMEOUT.as_secs()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            max_attempts: default_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            step_timeout_secs: default_step_timeout(),
            log_dir: None,
            download_dir: None,
            reboot: RebootSettings::default(),
        }
    }
}

/// Values supplied on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub state_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub max_cycles: Option<u32>,
    pub max_attempts: Option<u32>,
    pub reboot_mode: Option<RebootMode>,
    pub no_restart: bool,
    pub verbose: bool,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub manifest_path: PathBuf,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub download_dir: PathBuf,
    pub max_cycles: u32,
    pub max_attempts: u32,
    pub step_timeout: Duration,
    pub retry: RetryPolicy,
    pub reboot: RebootSettings,
    pub verbose: bool,
}

impl RunConfig {
    /// Resolve settings from the manifest, environment and CLI, in that order.
    pub fn resolve(manifest_path: &Path, settings: &Settings, cli: &RunOverrides) -> Result<Self> {
        let state_file = cli
            .state_file
            .clone()
            .or_else(|| std::env::var_os(STATE_ENV).map(PathBuf::from))
            .unwrap_or_else(default_state_file);

        let state_dir = state_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let log_dir = cli
            .log_dir
            .clone()
            .or_else(|| std::env::var_os(LOG_DIR_ENV).map(PathBuf::from))
            .or_else(|| settings.log_dir.clone())
            .unwrap_or_else(|| state_dir.join("logs"));

        let download_dir = settings
            .download_dir
            .clone()
            .unwrap_or_else(|| state_dir.join("downloads"));

        let max_cycles = cli.max_cycles.unwrap_or(settings.max_cycles);
        let max_attempts = cli.max_attempts.unwrap_or(settings.max_attempts);
        if max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if settings.step_timeout_secs == 0 {
            bail!("step_timeout_secs must be at least 1");
        }
        if settings.retry_max_delay_secs < settings.retry_base_delay_secs {
            bail!(
                "retry_max_delay_secs ({}) is smaller than retry_base_delay_secs ({})",
                settings.retry_max_delay_secs,
                settings.retry_base_delay_secs
            );
        }

        let mut reboot = settings.reboot.clone();
        if let Some(mode) = cli.reboot_mode {
            reboot.mode = mode;
        }
        if cli.no_restart {
            reboot.restart = false;
        }

        Ok(Self {
            manifest_path: manifest_path.to_path_buf(),
            state_file,
            log_dir,
            download_dir,
            max_cycles,
            max_attempts,
            step_timeout: Duration::from_secs(settings.step_timeout_secs),
            retry: RetryPolicy::linear(
                Duration::from_secs(settings.retry_base_delay_secs),
                Duration::from_secs(settings.retry_max_delay_secs),
            ),
            reboot,
            verbose: cli.verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        use anyhow::Context;
        if let Some(parent) = self.state_file.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.download_dir)
            .context("Failed to create download directory")?;
        Ok(())
    }
}

/// Fixed, documented state location for the host.
pub fn default_state_file() -> PathBuf {
    if cfg!(windows) {
        let program_data =
            std::env::var_os("ProgramData").unwrap_or_else(|| r"C:\ProgramData".into());
        PathBuf::from(program_data)
            .join("orchestrate")
            .join("state.json")
    } else {
        PathBuf::from("/var/lib/orchestrate/state.json")
    }
}
