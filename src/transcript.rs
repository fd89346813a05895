//! Write-only transcript sink.
//!
//! Each step gets its own append-only log file under the log directory, and
//! the rendered run summary is appended to `summary.log`. Nothing in the crate
//! reads these files back.

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "summary.log";

/// Append-only log file.
#[derive(Debug, Clone)]
pub struct Transcript {
    path: PathBuf,
}

impl Transcript {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Transcript for a single step: `<log_dir>/<step-id>.log`.
    pub fn for_step(log_dir: &Path, step_id: &str) -> Self {
        Self::new(log_dir.join(format!("{}.log", sanitize_file_name(step_id))))
    }

    pub fn summary(log_dir: &Path) -> Self {
        Self::new(log_dir.join(SUMMARY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Failures are logged and otherwise ignored so a full
    /// disk never turns into a step failure.
    pub fn append_line(&self, line: &str) {
        if let Err(e) = self.try_append(&format!("{}\n", line)) {
            tracing::warn!(path = %self.path.display(), "transcript write failed: {}", e);
        }
    }

    /// Append a timestamped header marking the start of an attempt.
    pub fn attempt_header(&self, step_id: &str, attempt: u32, cycle: u32) {
        self.append_line(&format!(
            "=== {} attempt {} (cycle {}) at {} ===",
            step_id,
            attempt,
            cycle,
            Utc::now().to_rfc3339()
        ));
    }

    pub fn append_block(&self, text: &str) {
        let mut block = text.to_string();
        if !block.ends_with('\n') {
            block.push('\n');
        }
        if let Err(e) = self.try_append(&block) {
            tracing::warn!(path = %self.path.display(), "transcript write failed: {}", e);
        }
    }

    fn try_append(&self, text: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(text.as_bytes())
    }
}

/// Replace characters that are not safe in a file name.
fn sanitize_file_name(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
