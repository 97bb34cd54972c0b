//! File-based logging
//!
//! Writes logs under the configured directory, separated by log type:
//! - `<dir>/main` - all events, JSON
//! - `<dir>/error` - warnings and errors only
//! - `<dir>/ws` - connection events (target `ws`)
//!
//! Connection code logs through `log_ws!` so its events land in the ws file.

use super::config::LoggingConfig;
use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::{filter_fn, LevelFilter},
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target used by `log_ws!`
pub const WS_TARGET: &str = "ws";

const LOG_TYPES: [&str; 3] = ["main", "error", WS_TARGET];

/// Initialize file logging (plus console if enabled)
///
/// Returns the appender guards; keep them alive for the duration of the
/// program or buffered lines are lost. RUST_LOG overrides the configured
/// filter.
///
/// # Errors
/// Fails if a log directory cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> crate::Result<Vec<WorkerGuard>> {
    create_log_dirs(&config.dir)?;

    let mut guards = Vec::with_capacity(LOG_TYPES.len());

    let (main_appender, main_guard) = create_appender(&config.dir, "main");
    guards.push(main_guard);

    let (error_appender, error_guard) = create_appender(&config.dir, "error");
    guards.push(error_guard);

    let (ws_appender, ws_guard) = create_appender(&config.dir, WS_TARGET);
    guards.push(ws_guard);

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(main_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .json();

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(LevelFilter::WARN);

    let ws_layer = tracing_subscriber::fmt::layer()
        .with_writer(ws_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(filter_fn(|metadata| is_ws_target(metadata.target())));

    let console_layer = config.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
    });

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(main_layer)
        .with(error_layer)
        .with(ws_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| crate::Error::Logging(e.to_string()))?;

    tracing::info!(dir = %config.dir.display(), "Logging system initialized");

    Ok(guards)
}

fn create_log_dirs(dir: &Path) -> io::Result<()> {
    for log_type in LOG_TYPES {
        fs::create_dir_all(dir.join(log_type))?;
    }
    Ok(())
}

fn is_ws_target(target: &str) -> bool {
    target == WS_TARGET || target.contains("tungstenite")
}

/// Create a daily rolling file appender in `<dir>/<name>`
fn create_appender(dir: &Path, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, dir.join(name), name);
    tracing_appender::non_blocking(appender)
}

/// Log under the `ws` target
#[macro_export]
macro_rules! log_ws {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "ws", $level, $($arg)+)
    };
}
