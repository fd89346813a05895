//! `orchestrate run`: load the manifest, take the run lock, drive the
//! orchestrator and print the summary on every exit path.

use anyhow::{Context, Result};
use orchestrate::checkpoint::{CheckpointStore, RunLock};
use orchestrate::config::{RebootMode, RunConfig, RunOverrides};
use orchestrate::manifest::Manifest;
use orchestrate::orchestrator::{EXIT_STORE_CORRUPT, Orchestrator, OrchestratorOptions};
use orchestrate::reboot::{Invocation, coordinator_for};
use orchestrate::report::{self, DeclaredStep};
use orchestrate::step::{DescriptorStep, StepEnv};
use orchestrate::transcript::Transcript;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::super::Cli;
use super::init_logging;

/// Flags of the `run` subcommand.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub steps: PathBuf,
    pub state: Option<PathBuf>,
    pub max_cycles: Option<u32>,
    pub max_attempts: Option<u32>,
    pub reboot: Option<RebootMode>,
    pub no_restart: bool,
    pub log_dir: Option<PathBuf>,
    pub json: bool,
}

pub async fn cmd_run(cli: &Cli, args: RunArgs) -> Result<u8> {
    let manifest = match Manifest::load(&args.steps) {
        Ok(m) => m,
        Err(e) => {
            init_logging(cli.verbose, None);
            return Err(e).context("Invalid step manifest");
        }
    };

    let overrides = RunOverrides {
        state_file: args.state.clone(),
        log_dir: args.log_dir.clone(),
        max_cycles: args.max_cycles,
        max_attempts: args.max_attempts,
        reboot_mode: args.reboot,
        no_restart: args.no_restart,
        verbose: cli.verbose,
    };
    let config = RunConfig::resolve(&args.steps, &manifest.settings, &overrides)?;
    config.ensure_directories()?;
    let _log_guard = init_logging(config.verbose, Some(&config.log_dir));

    let _lock = RunLock::acquire(&config.state_file)?;
    let store = CheckpointStore::new(&config.state_file);

    let env = StepEnv {
        log_dir: config.log_dir.clone(),
        download_dir: config.download_dir.clone(),
        max_attempts: config.max_attempts,
        timeout: config.step_timeout,
    };
    let steps = DescriptorStep::from_definitions(&manifest.steps, &env);
    let declared = DeclaredStep::from_steps(&steps);

    let invocation = resume_invocation(&args, &config)?;
    tracing::debug!(command = %invocation.command_line(), "resume command");

    let orchestrator = Orchestrator::new(
        steps,
        store.clone(),
        coordinator_for(&config.reboot),
        invocation,
        OrchestratorOptions {
            max_cycles: config.max_cycles,
            retry: config.retry,
            restart: config.reboot.restart,
            log_dir: Some(config.log_dir.clone()),
        },
    );
    watch_ctrl_c(orchestrator.cancel_handle());

    tracing::info!(
        manifest = %config.manifest_path.display(),
        state = %config.state_file.display(),
        reboot_mode = %config.reboot.mode,
        "starting"
    );

    match orchestrator.run().await {
        Ok(run) => {
            let summary = report::summarize(&declared, &run.state, Some(&run.outcome), run.elapsed);
            emit_summary(&summary, &config.log_dir, args.json)?;
            Ok(run.outcome.exit_code())
        }
        Err(e) if e.is_store_corrupt() => {
            tracing::error!("{}", e);
            eprintln!(
                "{} {}\nInspect or move the file, or run `orchestrate reset --force` to start over.",
                console::style("State file is corrupt:").red().bold(),
                e
            );
            Ok(EXIT_STORE_CORRUPT)
        }
        Err(e) => {
            // Still show how far the run got.
            if let Ok(state) = store.load_state() {
                let summary = report::summarize(&declared, &state, None, Duration::ZERO);
                emit_summary(&summary, &config.log_dir, args.json)?;
            }
            Err(e).context("Orchestration aborted")
        }
    }
}

fn emit_summary(summary: &report::RunSummary, log_dir: &Path, json: bool) -> Result<()> {
    let text = report::render_text(summary);
    if json {
        println!("{}", report::render_json(summary)?);
    } else {
        println!("{}", text);
    }
    Transcript::summary(log_dir).append_block(&console::strip_ansi_codes(&text));
    Ok(())
}

/// Set the cancellation flag on Ctrl-C. The orchestrator stops at the next
/// step boundary.
fn watch_ctrl_c(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing the current step");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

/// Command line the resume trigger runs after the reboot. Paths are made
/// absolute since the trigger starts in a different working directory.
fn resume_invocation(args: &RunArgs, config: &RunConfig) -> Result<Invocation> {
    let exe = std::env::current_exe().context("Failed to locate the orchestrate executable")?;
    let mut argv = vec![
        "run".to_string(),
        "--steps".to_string(),
        absolute(&config.manifest_path),
        "--state".to_string(),
        absolute(&config.state_file),
    ];
    if let Some(n) = args.max_cycles {
        argv.extend(["--max-cycles".to_string(), n.to_string()]);
    }
    if let Some(n) = args.max_attempts {
        argv.extend(["--max-attempts".to_string(), n.to_string()]);
    }
    if let Some(mode) = args.reboot {
        argv.extend(["--reboot".to_string(), mode.to_string()]);
    }
    if args.no_restart {
        argv.push("--no-restart".to_string());
    }
    if let Some(ref dir) = args.log_dir {
        argv.extend(["--log-dir".to_string(), absolute(dir)]);
    }
    Ok(Invocation::new(exe, argv))
}

fn absolute(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}
