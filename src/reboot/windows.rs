//! Windows resume triggers: a one-shot scheduled task or a RunOnce value.

use super::{Invocation, RebootCoordinator, restart_host, run_checked};
use crate::errors::OrchestratorError;
use async_trait::async_trait;

/// `schtasks /TR` rejects task commands longer than this.
pub const SCHTASKS_MAX_COMMAND: usize = 261;

pub const RUN_ONCE_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\RunOnce";

/// ONSTART scheduled task running as SYSTEM. `/F` replaces an existing task
/// of the same name, so scheduling twice never leaves two triggers. The
/// resumed run deletes the task, which makes it fire once.
pub struct ScheduledTaskCoordinator {
    task_name: String,
    restart_delay_secs: u32,
}

impl ScheduledTaskCoordinator {
    pub fn new(task_name: &str, restart_delay_secs: u32) -> Self {
        Self {
            task_name: task_name.to_string(),
            restart_delay_secs,
        }
    }

    pub fn create_args(&self, invocation: &Invocation) -> Result<Vec<String>, OrchestratorError> {
        let command = invocation.command_line();
        if command.len() > SCHTASKS_MAX_COMMAND {
            return Err(OrchestratorError::Reboot(format!(
                "resume command is {} characters; schtasks allows at most {}",
                command.len(),
                SCHTASKS_MAX_COMMAND
            )));
        }
        Ok(vec![
            "/Create".to_string(),
            "/TN".to_string(),
            self.task_name.clone(),
            "/SC".to_string(),
            "ONSTART".to_string(),
            "/RU".to_string(),
            "SYSTEM".to_string(),
            "/RL".to_string(),
            "HIGHEST".to_string(),
            "/TR".to_string(),
            command,
            "/F".to_string(),
        ])
    }

    pub fn delete_args(&self) -> Vec<String> {
        vec![
            "/Delete".to_string(),
            "/TN".to_string(),
            self.task_name.clone(),
            "/F".to_string(),
        ]
    }
}

#[async_trait]
impl RebootCoordinator for ScheduledTaskCoordinator {
    fn name(&self) -> &'static str {
        "scheduled-task"
    }

    async fn schedule_resume(&self, invocation: &Invocation) -> Result<bool, OrchestratorError> {
        let args = self.create_args(invocation)?;
        run_checked("schtasks.exe", args).await?;
        tracing::info!(task = %self.task_name, "registered resume task");
        Ok(true)
    }

    async fn clear_resume(&self) -> Result<(), OrchestratorError> {
        // Absent task is fine: nothing to clear.
        if let Err(e) = run_checked("schtasks.exe", self.delete_args()).await {
            tracing::debug!(task = %self.task_name, "resume task not removed: {}", e);
        }
        Ok(())
    }

    async fn restart(&self, reason: &str) -> Result<(), OrchestratorError> {
        restart_host(self.restart_delay_secs, reason).await
    }
}

/// `RunOnce` registry value. Windows deletes the value before running it, and
/// writing the same value name again overwrites rather than duplicates.
pub struct RunOnceCoordinator {
    value_name: String,
    restart_delay_secs: u32,
}

impl RunOnceCoordinator {
    pub fn new(value_name: &str, restart_delay_secs: u32) -> Self {
        Self {
            value_name: value_name.to_string(),
            restart_delay_secs,
        }
    }

    pub fn add_args(&self, invocation: &Invocation) -> Vec<String> {
        vec![
            "add".to_string(),
            RUN_ONCE_KEY.to_string(),
            "/v".to_string(),
            self.value_name.clone(),
            "/t".to_string(),
            "REG_SZ".to_string(),
            "/d".to_string(),
            invocation.command_line(),
            "/f".to_string(),
        ]
    }

    pub fn delete_args(&self) -> Vec<String> {
        vec![
            "delete".to_string(),
            RUN_ONCE_KEY.to_string(),
            "/v".to_string(),
            self.value_name.clone(),
            "/f".to_string(),
        ]
    }
}

#[async_trait]
impl RebootCoordinator for RunOnceCoordinator {
    fn name(&self) -> &'static str {
        "run-once"
    }

    async fn schedule_resume(&self, invocation: &Invocation) -> Result<bool, OrchestratorError> {
        run_checked("reg.exe", self.add_args(invocation)).await?;
        tracing::info!(value = %self.value_name, "registered RunOnce resume");
        Ok(true)
    }

    async fn clear_resume(&self) -> Result<(), OrchestratorError> {
        if let Err(e) = run_checked("reg.exe", self.delete_args()).await {
            tracing::debug!(value = %self.value_name, "RunOnce value not removed: {}", e);
        }
        Ok(())
    }

    async fn restart(&self, reason: &str) -> Result<(), OrchestratorError> {
        restart_host(self.restart_delay_secs, reason).await
    }
}
