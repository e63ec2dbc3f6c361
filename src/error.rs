//! Error types for tinyhttpd.
//!
//! Setup failures are fatal and carry enough context to print a diagnostic
//! and exit non-zero (§7 of the design doc); everything else is handled
//! internally by the event loop or a worker and never reaches `main`.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Fatal, process-ending errors. Every variant here maps to a non-zero exit
/// code; nothing downstream of setup ever constructs one of these.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind listening socket on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to create epoll instance: {0}")]
    EpollCreate(#[source] io::Error),

    #[error("failed to create self-pipe signal channel: {0}")]
    SelfPipe(#[source] io::Error),

    #[error("failed to install signal handler: {0}")]
    SignalInstall(#[source] io::Error),

    #[error("resource pool setup failed: {0}")]
    PoolInit(#[from] slotpool::PoolError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ServerError {
    /// Exit code to report to the shell. Kept distinct per failure class so
    /// a process supervisor can tell setup failures apart without parsing
    /// the message.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Bind { .. } => 10,
            ServerError::EpollCreate(_) => 12,
            ServerError::SelfPipe(_) => 13,
            ServerError::SignalInstall(_) => 14,
            ServerError::PoolInit(_) => 15,
            ServerError::Config(_) => 2,
        }
    }
}
