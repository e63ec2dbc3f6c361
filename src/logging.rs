//! Logging and tracing initialization.
//!
//! `-c` (close log) toggles whether connection-close lines are emitted at
//! all; `-l` (log write mode) selects between a synchronous writer (flushes
//! on the calling thread, simplest to reason about) and an asynchronous one
//! (lines are handed to a background thread over a bounded channel, so a
//! slow disk never blocks the event loop or a worker).

use std::fs::File;
use std::path::Path;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogWriteMode, ServerConfig};
use crate::error::{Result, ServerError};

/// Installs the global tracing subscriber. Must be called exactly once,
/// before any other component logs.
pub fn init(config: &ServerConfig) -> Result<()> {
    let level = if config.verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tinyhttpd={level}")));

    match (&config.log_file, config.log_write_mode) {
        (Some(path), LogWriteMode::Synchronous) => init_file_sync(path, env_filter),
        (Some(path), LogWriteMode::Asynchronous) => init_file_async(path, env_filter),
        (None, _) => init_stdout(env_filter),
    }
}

fn init_stdout(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer().with_target(false).compact();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

fn init_file_sync(path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(path).map_err(|e| {
        ServerError::Config(format!("failed to create log file {}: {e}", path.display()))
    })?;
    let fmt_layer = fmt::layer().with_writer(file).with_ansi(false).json();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

/// Asynchronous writer: a dedicated thread owns the file and drains a
/// bounded channel of already-formatted lines, so `write(2)` latency never
/// lands on the event loop or a worker thread.
fn init_file_async(path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(path).map_err(|e| {
        ServerError::Config(format!("failed to create log file {}: {e}", path.display()))
    })?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    // Leak the guard: it must outlive the subscriber, and the subscriber is
    // global for the life of the process.
    Box::leak(Box::new(guard));

    let fmt_layer = fmt::layer().with_writer(writer).with_ansi(false).json();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

/// Emits a connection-close event, respecting `-c`'s disable switch.
pub fn log_close(close_log_enabled: bool, slot: usize, reason: &str) {
    if close_log_enabled {
        tracing::debug!(slot, reason, "connection closed");
    }
}
