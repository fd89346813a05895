//! Child-process execution for installer and command steps.
//!
//! Installers are awaited to completion with a per-step timeout. On timeout the
//! child is killed (`kill_on_drop`) and the attempt is reported as transient.

use crate::errors::StepError;
use crate::transcript::Transcript;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// What to run and how long to wait for it.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            timeout,
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Outcome of running a child process.
#[derive(Debug, Clone)]
pub enum ProcessResult {
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        after: Duration,
    },
}

/// Spawn `spec`, wait for it (bounded by its timeout), and append its output to
/// `transcript` when one is given.
///
/// A program that cannot be found is a permanent failure; any other spawn or
/// wait error is transient.
pub async fn run_process(
    spec: &ProcessSpec,
    transcript: Option<&Transcript>,
) -> Result<ProcessResult, StepError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = spec.working_dir {
        cmd.current_dir(dir);
    }

    tracing::debug!(command = %spec.display(), timeout_secs = spec.timeout.as_secs(), "spawning");
    if let Some(t) = transcript {
        t.append_line(&format!("$ {}", spec.display()));
    }

    let start = Instant::now();
    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StepError::permanent(format!("Program not found: {}", spec.program))
        } else {
            StepError::transient(format!("Failed to spawn {}: {}", spec.program, e))
        }
    })?;

    let output = match timeout(spec.timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| {
            StepError::transient(format!("Failed to wait for {}: {}", spec.program, e))
        })?,
        Err(_) => {
            let after = start.elapsed();
            tracing::warn!(command = %spec.display(), "timed out after {}s", after.as_secs());
            if let Some(t) = transcript {
                t.append_line(&format!("timed out after {}s, child killed", after.as_secs()));
            }
            return Ok(ProcessResult::TimedOut { after });
        }
    };

    let duration = start.elapsed();
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if let Some(t) = transcript {
        if !stdout.trim().is_empty() {
            t.append_line(stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            t.append_line(&format!("[stderr] {}", stderr.trim_end()));
        }
        t.append_line(&format!(
            "exit code {} after {:.1}s",
            code,
            duration.as_secs_f64()
        ));
    }
    tracing::debug!(command = %spec.display(), code, "child exited");

    Ok(ProcessResult::Exited {
        code,
        stdout,
        stderr,
    })
}
