use anyhow::{Context, Result};
use dialoguer::Confirm;
use orchestrate::checkpoint::{CheckpointStore, RunLock};
use orchestrate::errors::StoreError;
use std::path::Path;

use super::state_path;

/// Operator reset of one step or the whole state file.
///
/// Resetting everything does not read the existing file, so it also recovers
/// from a corrupt state.
pub fn cmd_reset(state: Option<&Path>, step: Option<&str>, force: bool) -> Result<u8> {
    let path = state_path(state);
    let store = CheckpointStore::new(&path);

    if !store.exists() {
        println!("No state file at {}. Nothing to reset.", path.display());
        return Ok(0);
    }

    let _lock = RunLock::acquire(&path)?;

    if !force {
        let prompt = match step {
            Some(id) => format!("Step '{}' will run again on the next invocation. Continue?", id),
            None => "This will discard all checkpoints and cycle history. Are you sure?".to_string(),
        };
        let confirm = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(0);
        }
    }

    match step {
        Some(id) => {
            if !store.reset(id).context("Failed to reset step")? {
                return Err(StoreError::UnknownStep(id.to_string()).into());
            }
            println!("Step '{}' reset", id);
        }
        None => {
            store.reset_all().context("Failed to reset state")?;
            println!("Reset complete: {}", store.path().display());
        }
    }
    Ok(0)
}
