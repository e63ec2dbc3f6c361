//! slotpool: a fixed-size, thread-blocking resource pool.
//!
//! Mirrors a MySQL-style connection pool: a counting semaphore (implemented
//! here as a `Mutex` + `Condvar`, matching the synchronous, non-async
//! concurrency primitives the rest of this server uses) gates access to a
//! deque of pre-established, opaque handles. This crate is pure logic with
//! zero knowledge of what a handle actually is — database connection, pooled
//! file descriptor, or anything else the caller wants to reuse.

pub mod error;
pub mod pool;

pub use error::{PoolError, Result};
pub use pool::{HandlePool, PoolStats, PooledHandle};
