//! Reboot coordination: register a one-shot resume trigger, then restart.
//!
//! The orchestrator always persists its checkpoint and resume marker before
//! calling [`RebootCoordinator::schedule_resume`], and only then
//! [`RebootCoordinator::restart`].

pub mod windows;

pub use windows::{RunOnceCoordinator, ScheduledTaskCoordinator};

use crate::config::{RebootMode, RebootSettings};
use crate::errors::OrchestratorError;
use crate::step::process::{ProcessResult, ProcessSpec, run_process};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Command line that re-runs the orchestrator after the reboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Single command-line string with Windows-style quoting for parts that
    /// contain whitespace or quotes.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|part| quote_arg(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

/// Arranges for the orchestrator to run again once after the host restarts.
#[async_trait]
pub trait RebootCoordinator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register the resume trigger. Returns whether anything was registered.
    ///
    /// Calling this twice before the reboot must not create two triggers.
    async fn schedule_resume(&self, invocation: &Invocation) -> Result<bool, OrchestratorError>;

    /// Remove a trigger left from the previous cycle. Called by the resumed run.
    async fn clear_resume(&self) -> Result<(), OrchestratorError>;

    /// Restart the host.
    async fn restart(&self, reason: &str) -> Result<(), OrchestratorError>;
}

/// Registers nothing and never restarts. The calling automation reboots the
/// host and re-invokes the orchestrator itself.
#[derive(Debug, Default)]
pub struct ManualCoordinator;

#[async_trait]
impl RebootCoordinator for ManualCoordinator {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn schedule_resume(&self, invocation: &Invocation) -> Result<bool, OrchestratorError> {
        tracing::info!(
            command = %invocation.command_line(),
            "reboot mode is 'none'; re-invoke after the host restarts"
        );
        Ok(false)
    }

    async fn clear_resume(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn restart(&self, _reason: &str) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

/// Build the coordinator selected by `settings.mode`.
pub fn coordinator_for(settings: &RebootSettings) -> Box<dyn RebootCoordinator> {
    match settings.mode {
        RebootMode::ScheduledTask => Box::new(ScheduledTaskCoordinator::new(
            &settings.task_name,
            settings.delay_secs,
        )),
        RebootMode::RunOnce => Box::new(RunOnceCoordinator::new(
            &settings.task_name,
            settings.delay_secs,
        )),
        RebootMode::None => Box::new(ManualCoordinator),
    }
}

/// Restart command for the current platform.
pub fn restart_command(delay_secs: u32, reason: &str) -> (String, Vec<String>) {
    if cfg!(windows) {
        (
            "shutdown.exe".to_string(),
            vec![
                "/r".to_string(),
                "/t".to_string(),
                delay_secs.to_string(),
                "/c".to_string(),
                reason.to_string(),
                "/d".to_string(),
                "p:4:1".to_string(),
            ],
        )
    } else {
        // `shutdown` takes whole minutes; a non-zero delay never shortens to now.
        let when = if delay_secs == 0 {
            "now".to_string()
        } else {
            format!("+{}", delay_secs.div_ceil(60))
        };
        ("shutdown".to_string(), vec!["-r".to_string(), when])
    }
}

/// Run an OS command used for coordination, failing on non-zero exit.
pub(crate) async fn run_checked(program: &str, args: Vec<String>) -> Result<(), OrchestratorError> {
    let spec = ProcessSpec::new(program, args, COMMAND_TIMEOUT);
    match run_process(&spec, None).await {
        Ok(ProcessResult::Exited { code: 0, .. }) => Ok(()),
        Ok(ProcessResult::Exited { code, stderr, .. }) => Err(OrchestratorError::Reboot(format!(
            "`{}` exited {}: {}",
            spec.display(),
            code,
            stderr.trim()
        ))),
        Ok(ProcessResult::TimedOut { .. }) => Err(OrchestratorError::Reboot(format!(
            "`{}` timed out",
            spec.display()
        ))),
        Err(e) => Err(OrchestratorError::Reboot(e.to_string())),
    }
}

pub(crate) async fn restart_host(delay_secs: u32, reason: &str) -> Result<(), OrchestratorError> {
    let (program, args) = restart_command(delay_secs, reason);
    tracing::warn!(delay_secs, "restarting host: {}", reason);
    run_checked(&program, args).await
}
