use super::{Checkpoint, CycleRecord, HostIdentity, ResumeMarker, STATE_VERSION, StateFile};
use crate::errors::StoreError;
use crate::step::StepOutcome;
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// File-backed checkpoint store.
///
/// Every operation opens, reads, writes and closes the state file within the
/// call; no handle or lock is held between calls. Writes go to a temp file in
/// the same directory, are fsynced, and are renamed over the old file, so a
/// crash leaves either the previous or the new state, never a torn one.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    identity: HostIdentity,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_identity(path, HostIdentity::current())
    }

    /// Store bound to a host name with no machine id.
    #[cfg(test)]
    pub fn with_host(path: impl Into<PathBuf>, host: &str) -> Self {
        Self::with_identity(path, HostIdentity::named(host))
    }

    pub fn with_identity(path: impl Into<PathBuf>, identity: HostIdentity) -> Self {
        Self {
            path: path.into(),
            identity,
        }
    }

    fn fresh_state(&self) -> StateFile {
        let mut state = StateFile::new(&self.identity.host_name);
        self.identity.apply(&mut state);
        state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the full state.
    ///
    /// A missing file yields a fresh state. A file that cannot be parsed, or
    /// carries an unknown version, is `StoreError::Corrupt` and is left
    /// untouched.
    ///
    /// A file written on a different host (a cloned image) is archived next to
    /// the original and a fresh state is returned. A file holding a resume
    /// marker is always kept: the host rebooted mid-run, possibly after a
    /// rename, and the run must carry on.
    pub fn load_state(&self) -> Result<StateFile, StoreError> {
        if !self.path.exists() {
            return Ok(self.fresh_state());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        let mut state: StateFile =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if state.version != STATE_VERSION {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                reason: format!(
                    "unsupported state version {} (expected {})",
                    state.version, STATE_VERSION
                ),
            });
        }

        if !self.identity.owns(&state) {
            if state.resume.is_none() {
                let archived = self.archive_foreign(&state.host)?;
                tracing::warn!(
                    state_host = %state.host,
                    this_host = %self.identity.host_name,
                    archived = %archived.display(),
                    "state file belongs to another host, archived and starting fresh"
                );
                return Ok(self.fresh_state());
            }
            tracing::warn!(
                state_host = %state.host,
                this_host = %self.identity.host_name,
                "host identity changed across a scheduled reboot, keeping state"
            );
        }
        self.identity.apply(&mut state);

        Ok(state)
    }

    /// Checkpoints keyed by step id.
    pub fn load(&self) -> Result<BTreeMap<String, Checkpoint>, StoreError> {
        Ok(self.load_state()?.checkpoints)
    }

    /// Persist that an attempt of `step_id` is starting in `cycle`.
    ///
    /// Returns the attempt number (1-based, across all cycles).
    pub fn begin_attempt(&self, step_id: &str, cycle: u32) -> Result<u32, StoreError> {
        self.update(|state| {
            if !state.cycle.steps_attempted.iter().any(|s| s == step_id) {
                state.cycle.steps_attempted.push(step_id.to_string());
            }
            let now = Utc::now();
            let cp = state.checkpoint_mut(step_id);
            cp.attempts_made += 1;
            cp.in_flight = true;
            cp.cycle = cycle;
            cp.last_attempt_at = Some(now);
            cp.first_started_at.get_or_insert(now);
            cp.attempts_made
        })
    }

    /// Record the outcome of `attempt_number` and flush before returning.
    pub fn record(
        &self,
        step_id: &str,
        outcome: &StepOutcome,
        attempt_number: u32,
        elapsed: Duration,
    ) -> Result<Checkpoint, StoreError> {
        self.update(|state| {
            let cp = state.checkpoint_mut(step_id);
            cp.attempts_made = cp.attempts_made.max(attempt_number);
            cp.in_flight = false;
            cp.last_outcome = Some(outcome.clone());
            cp.elapsed_ms = cp.elapsed_ms.saturating_add(elapsed.as_millis() as u64);
            if outcome.is_failure() {
                cp.consecutive_failures += 1;
            } else {
                cp.consecutive_failures = 0;
            }
            if outcome.is_terminal() {
                cp.completed_at = Some(Utc::now());
            }
            cp.clone()
        })
    }

    /// Mark `step_id` complete because its idempotent check already holds.
    pub fn record_satisfied(&self, step_id: &str) -> Result<Checkpoint, StoreError> {
        self.update(|state| {
            let cp = state.checkpoint_mut(step_id);
            cp.in_flight = false;
            cp.consecutive_failures = 0;
            cp.satisfied_by_check = true;
            cp.last_outcome = Some(StepOutcome::Success);
            cp.completed_at = Some(Utc::now());
            cp.clone()
        })
    }

    /// Close out attempts that were started but never recorded. Each becomes
    /// a retryable failure that counts against the step's budget.
    ///
    /// Returns the ids of the interrupted steps.
    pub fn recover_interrupted(&self) -> Result<Vec<String>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let state = self.load_state()?;
        if !state.checkpoints.values().any(|cp| cp.in_flight) {
            return Ok(Vec::new());
        }
        self.update(|state| {
            let mut recovered = Vec::new();
            for cp in state.checkpoints.values_mut().filter(|cp| cp.in_flight) {
                cp.in_flight = false;
                cp.consecutive_failures += 1;
                cp.last_outcome = Some(StepOutcome::failed(
                    "interrupted before the outcome was recorded",
                    true,
                ));
                recovered.push(cp.step_id.clone());
            }
            recovered
        })
    }

    /// Persist the current cycle number, archiving the previous cycle record.
    pub fn mark_cycle(&self, cycle_number: u32) -> Result<CycleRecord, StoreError> {
        self.update(|state| {
            if state.cycle.cycle_number != cycle_number {
                let previous = std::mem::replace(&mut state.cycle, CycleRecord::new(cycle_number));
                state.cycle_history.push(previous);
            }
            state.cycle.clone()
        })
    }

    pub fn mark_awaiting_reboot(&self, marker: ResumeMarker) -> Result<(), StoreError> {
        self.update(|state| {
            state.resume = Some(marker);
        })
    }

    /// Remove and return the resume marker.
    pub fn clear_resume(&self) -> Result<Option<ResumeMarker>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        self.update(|state| state.resume.take())
    }

    /// Operator action: forget `step_id` so it runs again.
    ///
    /// Returns false if there was no checkpoint for the step.
    pub fn reset(&self, step_id: &str) -> Result<bool, StoreError> {
        let removed = self.update(|state| state.checkpoints.remove(step_id).is_some())?;
        if removed {
            tracing::warn!(
                step = step_id,
                "checkpoint reset by operator, step will execute again regardless of prior outcome"
            );
        }
        Ok(removed)
    }

    /// Operator action: discard all checkpoints and cycle history.
    pub fn reset_all(&self) -> Result<(), StoreError> {
        self.save(&self.fresh_state())?;
        tracing::warn!(path = %self.path.display(), "all checkpoints reset by operator");
        Ok(())
    }

    /// Load, mutate and durably save the state.
    fn update<T>(&self, f: impl FnOnce(&mut StateFile) -> T) -> Result<T, StoreError> {
        let mut state = self.load_state()?;
        let result = f(&mut state);
        state.updated_at = Utc::now();
        self.save(&state)?;
        Ok(result)
    }

    fn save(&self, state: &StateFile) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state).map_err(StoreError::Serialize)?;
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn archive_foreign(&self, foreign_host: &str) -> Result<PathBuf, StoreError> {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let archived = self.path.with_file_name(format!(
            "{}.foreign-{}-{}.json",
            stem,
            foreign_host,
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        std::fs::rename(&self.path, &archived).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(archived)
    }
}
