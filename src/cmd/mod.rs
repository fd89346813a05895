//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `run`      | `Run`            |
//! | `status`   | `Status`         |
//! | `reset`    | `Reset`          |
//! | `validate` | `Validate`       |
//!
//! Every command returns the process exit code on success; errors are printed
//! by `main` and exit 1.

pub mod reset;
pub mod run;
pub mod status;
pub mod validate;

pub use reset::cmd_reset;
pub use run::{RunArgs, cmd_run};
pub use status::cmd_status;
pub use validate::cmd_validate;

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const RUN_LOG_FILE: &str = "orchestrate.log";

/// Install the global subscriber: `RUST_LOG`-driven filter, human output on
/// stderr and, when `log_dir` is given, a plain-text copy in
/// `<log_dir>/orchestrate.log`.
///
/// Keep the returned guard alive until exit so buffered lines are flushed.
pub fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, RUN_LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A subscriber may already be installed (tests); keep the existing one.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init();
    guard
}

/// State file from the flag or environment, else the host default.
pub fn state_path(state: Option<&Path>) -> PathBuf {
    state
        .map(Path::to_path_buf)
        .unwrap_or_else(orchestrate::config::default_state_file)
}
