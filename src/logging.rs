//! Logging setup
//!
//! One registry with a rolling file layer (JSON or plain) and, in plain mode,
//! a stdout layer. `RUST_LOG` overrides the configured filter. Per-component
//! levels name modules of this crate:
//!
//! ```yaml
//! log:
//!   log_level: info
//!   components:
//!     watcher: debug
//!     two_phase::recovery: trace
//! ```
//!
//! Coordinator and watcher work runs inside `two_phase_transfer` and
//! `subscription` spans, so file output carries the transfer id or the
//! subscription name on every event.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LogConfig;
use crate::error::LedgerError;

const CRATE_TARGET: &str = env!("CARGO_CRATE_NAME");

/// Filter directives for `config`: the base level, then one
/// `wallet_ledger::<component>=<level>` per configured component
pub fn directives(config: &LogConfig) -> String {
    let mut parts = vec![config.log_level.clone()];
    parts.extend(
        config
            .components
            .iter()
            .map(|(component, level)| format!("{CRATE_TARGET}::{component}={level}")),
    );
    parts.join(",")
}

/// Parse the configured directives; a bad level is a config error
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LedgerError> {
    let directives = directives(config);
    EnvFilter::try_new(&directives)
        .map_err(|e| LedgerError::Config(format!("log filter `{directives}`: {e}")))
}

fn rotation(config: &LogConfig) -> Rotation {
    match config.rotation.as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Install the global subscriber; keep the guard alive to flush the file writer
///
/// Fails if the log directory cannot be opened, the filter does not parse,
/// or a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<WorkerGuard, LedgerError> {
    let file_appender = RollingFileAppender::builder()
        .rotation(rotation(config))
        .filename_prefix(&config.log_file)
        .build(&config.log_dir)
        .map_err(|e| LedgerError::Config(format!("log file in {}: {e}", config.log_dir)))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(config)?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).try_init()
    } else {
        let file_layer = fmt::layer()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).try_init()
    };
    installed.map_err(|e| LedgerError::Config(format!("logging already initialized: {e}")))?;

    Ok(guard)
}
