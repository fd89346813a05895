//! Single-instance guard for a state file.
//!
//! The lock lives in a sibling `<state>.lock` file, never on the state file
//! itself, so store reads and writes stay lock-free. The OS drops the lock if
//! the process dies.

use crate::errors::OrchestratorError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the exclusive run lock for `state_file` without blocking.
    pub fn acquire(state_file: &Path) -> Result<Self, OrchestratorError> {
        let path = lock_path(state_file);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| OrchestratorError::LockIo {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| OrchestratorError::LockIo {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(OrchestratorError::Locked { path })
            }
            Err(source) => Err(OrchestratorError::LockIo { path, source }),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "run lock released");
    }
}

fn lock_path(state_file: &Path) -> PathBuf {
    let mut name = state_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".lock");
    state_file.with_file_name(name)
}
