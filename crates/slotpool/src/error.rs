//! Error types for the resource pool.

use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur while constructing or using a [`crate::HandlePool`].
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool was constructed with zero handles. A pool with no handles
    /// can never satisfy an `acquire`, so this is treated as a setup-time
    /// configuration error rather than something a caller can recover from.
    #[error("resource pool configured with zero handles")]
    Empty,
}
