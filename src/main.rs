use clap::{Parser, Subcommand};
use orchestrate::config::{LOG_DIR_ENV, RebootMode, STATE_ENV};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "orchestrate")]
#[command(version, about = "Reboot-spanning provisioning orchestrator for golden images")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run (or resume) the steps in a manifest
    Run {
        /// Step manifest (.toml or .json)
        #[arg(long)]
        steps: PathBuf,

        /// Checkpoint state file
        #[arg(long, env = STATE_ENV)]
        state: Option<PathBuf>,

        /// Reboot cycles allowed before the run is fatal
        #[arg(long)]
        max_cycles: Option<u32>,

        /// Default attempt budget for steps that don't set one
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Resume mechanism: scheduled-task, run-once, none
        #[arg(long)]
        reboot: Option<RebootMode>,

        /// Schedule the resume but leave restarting the host to the caller
        #[arg(long)]
        no_restart: bool,

        /// Directory for step transcripts and the run log
        #[arg(long, env = LOG_DIR_ENV)]
        log_dir: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show checkpoint state
    Status {
        #[arg(long, env = STATE_ENV)]
        state: Option<PathBuf>,

        /// Manifest used to list steps in declared order
        #[arg(long)]
        steps: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
    /// Forget checkpoints so steps run again
    Reset {
        #[arg(long, env = STATE_ENV)]
        state: Option<PathBuf>,

        /// Reset only this step
        #[arg(long)]
        step: Option<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Check a manifest without running anything
    Validate {
        #[arg(long)]
        steps: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run {
            steps,
            state,
            max_cycles,
            max_attempts,
            reboot,
            no_restart,
            log_dir,
            json,
        } => {
            let args = cmd::RunArgs {
                steps: steps.clone(),
                state: state.clone(),
                max_cycles: *max_cycles,
                max_attempts: *max_attempts,
                reboot: *reboot,
                no_restart: *no_restart,
                log_dir: log_dir.clone(),
                json: *json,
            };
            cmd::cmd_run(&cli, args).await
        }
        Commands::Status { state, steps, json } => {
            cmd::init_logging(cli.verbose, None);
            cmd::cmd_status(state.as_deref(), steps.as_deref(), *json)
        }
        Commands::Reset { state, step, force } => {
            cmd::init_logging(cli.verbose, None);
            cmd::cmd_reset(state.as_deref(), step.as_deref(), *force)
        }
        Commands::Validate { steps } => {
            cmd::init_logging(cli.verbose, None);
            cmd::cmd_validate(steps)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
            ExitCode::from(1)
        }
    }
}
