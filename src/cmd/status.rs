use anyhow::{Context, Result};
use orchestrate::checkpoint::CheckpointStore;
use orchestrate::manifest::Manifest;
use orchestrate::orchestrator::EXIT_STORE_CORRUPT;
use orchestrate::report::{self, DeclaredStep};
use std::path::Path;

use super::state_path;

pub fn cmd_status(state: Option<&Path>, steps: Option<&Path>, json: bool) -> Result<u8> {
    let path = state_path(state);
    let store = CheckpointStore::new(&path);

    if !store.exists() {
        println!();
        println!("No state file at {}. Nothing has run yet.", path.display());
        println!();
        return Ok(0);
    }

    let state = match store.load_state() {
        Ok(state) => state,
        Err(e) if e.is_corrupt() => {
            eprintln!("{} {}", console::style("State file is corrupt:").red().bold(), e);
            return Ok(EXIT_STORE_CORRUPT);
        }
        Err(e) => return Err(e).context("Failed to read state file"),
    };

    let declared: Vec<DeclaredStep> = match steps {
        Some(manifest) => {
            let manifest = Manifest::load(manifest).context("Invalid step manifest")?;
            manifest
                .steps
                .iter()
                .map(|s| DeclaredStep {
                    id: s.id.clone(),
                    kind: Some(s.kind),
                })
                .collect()
        }
        None => DeclaredStep::from_state(&state),
    };

    let elapsed = (state.updated_at - state.created_at)
        .to_std()
        .unwrap_or_default();
    let summary = report::summarize(&declared, &state, None, elapsed);

    if json {
        println!("{}", report::render_json(&summary)?);
        return Ok(0);
    }

    println!("State: {}", store.path().display());
    println!(
        "Host: {}   Cycle: {}   Updated: {}",
        state.host,
        state.cycle.cycle_number,
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ref marker) = state.resume {
        println!(
            "{} after '{}' (scheduled {}, trigger registered: {})",
            console::style("Awaiting reboot").yellow().bold(),
            marker.after_step,
            marker.scheduled_at.format("%Y-%m-%d %H:%M:%S UTC"),
            marker.trigger_registered
        );
    }
    print!("{}", report::render_text(&summary));
    println!();
    Ok(0)
}
