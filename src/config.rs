//! Command-line configuration surface.
//!
//! Every flag from the distilled interface (`-p -l -m -o -s -t -c -a`) plus
//! the ambient-stack additions (`-q -x -v --log-file`) parse into one typed
//! `ServerConfig` value. Nothing here is a process-wide singleton: the value
//! is constructed once in `main` and threaded explicitly into the reactor,
//! worker pool, resource pool, and logging initializer.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Result, ServerError};

/// Edge- or level-triggered, independently for the listen fd and accepted
/// connection fds, matching the four combinations the original `-m` flag
/// selects between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

/// Listen-fd / connection-fd trigger pair, decoded from `-m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrigModePair {
    pub listen: TriggerMode,
    pub conn: TriggerMode,
}

impl TrigModePair {
    fn from_flag(value: u8) -> Result<Self> {
        use TriggerMode::{Edge, Level};
        let pair = match value {
            0 => (Level, Level),
            1 => (Level, Edge),
            2 => (Edge, Level),
            3 => (Edge, Edge),
            other => {
                return Err(ServerError::Config(format!(
                    "invalid trigger mode {other}, expected 0-3"
                )))
            }
        };
        Ok(Self {
            listen: pair.0,
            conn: pair.1,
        })
    }
}

/// Dispatch mode for readiness events (§4.4, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorModel {
    /// The event loop performs I/O inline; workers run application logic
    /// on data that has already been read.
    Proactor,
    /// Workers perform the I/O themselves; the event loop only dispatches.
    Reactor,
}

impl ActorModel {
    fn from_flag(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ActorModel::Proactor),
            1 => Ok(ActorModel::Reactor),
            other => Err(ServerError::Config(format!(
                "invalid actor model {other}, expected 0 (proactor) or 1 (reactor)"
            ))),
        }
    }
}

/// Whether the log writer flushes synchronously on the calling thread or
/// hands lines to a background writer thread over a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWriteMode {
    Synchronous,
    Asynchronous,
}

impl LogWriteMode {
    fn from_flag(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogWriteMode::Synchronous),
            1 => Ok(LogWriteMode::Asynchronous),
            other => Err(ServerError::Config(format!(
                "invalid log write mode {other}, expected 0 (sync) or 1 (async)"
            ))),
        }
    }
}

/// `SO_LINGER` policy applied to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LingerOption {
    /// `{0, 1}`: force RST on close, skip TIME_WAIT.
    Off,
    /// `{1, 1}`: graceful close.
    On,
}

impl LingerOption {
    fn from_flag(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LingerOption::Off),
            1 => Ok(LingerOption::On),
            other => Err(ServerError::Config(format!(
                "invalid linger option {other}, expected 0 (off) or 1 (on)"
            ))),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "A small HTTP/1.1 server on a threaded epoll reactor", long_about = None)]
struct Cli {
    /// Listen port
    #[arg(short = 'p', long, default_value_t = 9006)]
    port: u16,

    /// Log write mode: 0 synchronous, 1 asynchronous
    #[arg(short = 'l', long = "log-mode", default_value_t = 0)]
    log_mode: u8,

    /// Trigger mode: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET (listen + conn)
    #[arg(short = 'm', long = "trig-mode", default_value_t = 0)]
    trig_mode: u8,

    /// Linger option: 0 off, 1 on
    #[arg(short = 'o', long = "linger", default_value_t = 0)]
    linger: u8,

    /// Database pool size
    #[arg(short = 's', long = "pool-size", default_value_t = 8)]
    pool_size: u16,

    /// Worker thread count
    #[arg(short = 't', long = "threads", default_value_t = 8)]
    threads: u16,

    /// Close log: 0 enabled, 1 disabled
    #[arg(short = 'c', long = "close-log", default_value_t = 0)]
    close_log: u8,

    /// Actor model: 0 Proactor, 1 Reactor
    #[arg(short = 'a', long = "actor-model", default_value_t = 0)]
    actor_model: u8,

    /// Request queue capacity
    #[arg(short = 'q', long = "queue-capacity", default_value_t = 10_000)]
    queue_capacity: usize,

    /// Maximum simultaneous connections
    #[arg(short = 'x', long = "max-conn", default_value_t = 65_536)]
    max_fd: usize,

    /// Verbose (debug-level) logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Write structured logs to this file instead of stdout
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

/// Fully validated, typed server configuration. Constructed once in `main`
/// and passed by reference (or clone, where `Copy`) into every component
/// that needs it — no global state.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub log_write_mode: LogWriteMode,
    pub trig_mode: TrigModePair,
    pub linger: LingerOption,
    pub pool_size: u16,
    pub threads: u16,
    pub close_log: bool,
    pub actor_model: ActorModel,
    pub queue_capacity: usize,
    pub max_fd: usize,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Parse CLI flags from `std::env::args()` into a validated config.
    pub fn from_args() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        if cli.pool_size == 0 {
            return Err(ServerError::Config("pool size must be at least 1".into()));
        }
        if cli.threads == 0 {
            return Err(ServerError::Config("thread count must be at least 1".into()));
        }
        if cli.queue_capacity == 0 {
            return Err(ServerError::Config("queue capacity must be at least 1".into()));
        }

        Ok(Self {
            port: cli.port,
            log_write_mode: LogWriteMode::from_flag(cli.log_mode)?,
            trig_mode: TrigModePair::from_flag(cli.trig_mode)?,
            linger: LingerOption::from_flag(cli.linger)?,
            pool_size: cli.pool_size,
            threads: cli.threads,
            close_log: cli.close_log == 0,
            actor_model: ActorModel::from_flag(cli.actor_model)?,
            queue_capacity: cli.queue_capacity,
            max_fd: cli.max_fd,
            verbose: cli.verbose,
            log_file: cli.log_file,
        })
    }
}
