//! Tracing setup shared by every binary in the workspace.

use std::fs;
use std::path::Path;

use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config;

/// Installs the global subscriber: a daily-rolling file layer under `log_dir`
/// plus an optional stdout layer when `LOG_TO_STDOUT=true`.
///
/// The returned guard flushes the file writer on drop, so keep it alive for the
/// lifetime of the process.
pub fn init_logging(log_dir: impl AsRef<Path>, log_file: &str) -> WorkerGuard {
    let log_dir = log_dir.as_ref();
    fs::create_dir_all(log_dir).ok();

    let file_appender = rolling::daily(log_dir, log_file);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    let stdout_layer = config::log_to_stdout().then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(true)
    });

    let registry = tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stdout_layer);

    if registry.try_init().is_err() {
        tracing::debug!("Global subscriber already installed; keeping the existing one");
    }

    guard
}

/// `LOG_LEVEL` from the environment wins; otherwise the configured default.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(config::log_level()))
}
