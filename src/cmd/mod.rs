//! CLI command handlers. Thin: load config, build the pipeline, print,
//! map outcomes to exit codes.

pub mod db;
pub mod run;
pub mod scan;
pub mod session;
pub mod status;

use std::sync::Arc;

use anyhow::Result;
use console::style;

use prforge::config::{AppConfig, config_path_from_env, load_config, prforge_home};
use prforge::state::{StateDb, StateHandle};

/// Exit code for configuration problems (same as needs-human: an operator
/// must act).
pub const EXIT_CONFIG: i32 = 2;

/// Load config or print every error and return the config exit code.
pub fn load_config_or_exit() -> Result<Arc<AppConfig>, i32> {
    let path = config_path_from_env();
    let result = load_config(path.as_deref());
    match result.config {
        Some(config) => Ok(Arc::new(config)),
        None => {
            for error in &result.errors {
                eprintln!("{} {}", style("Config error:").red().bold(), error);
            }
            Err(EXIT_CONFIG)
        }
    }
}

/// Open the state database configured for this installation.
pub fn open_state(config: &AppConfig) -> Result<StateHandle> {
    let db = StateDb::new(&config.db_path())?;
    Ok(StateHandle::new(db))
}

/// Initialize tracing: terminal output filtered by `RUST_LOG` (info when
/// verbose, warn otherwise) plus a file log under the prforge home.
/// Returns the appender guard; dropping it flushes the file writer.
pub fn init_tracing(verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_level = if verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let log_dir = prforge_home().join("logs");
    let guard = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "prforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer),
                )
                .try_init();
            Some(guard)
        }
        Err(_) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                )
                .try_init();
            None
        }
    };
    guard
}
