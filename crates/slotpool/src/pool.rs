//! Fixed-size resource pool guarded by a counting semaphore.
//!
//! Modeled on a MySQL-style connection pool: a fixed number of opaque
//! handles are created once at startup, and threads block in `acquire`
//! until a handle is returned by another thread. FIFO issue order falls
//! out of the backing deque; it minimizes per-handle idle time but is not
//! required for correctness.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{PoolError, Result};

struct PoolState<T> {
    idle: VecDeque<T>,
    outstanding: usize,
}

/// A fixed-size FIFO pool of opaque handles.
///
/// `acquire` blocks the calling thread until a handle is available;
/// `release` (done implicitly by dropping the [`PooledHandle`] guard)
/// wakes exactly one waiter. The pool never grows or shrinks past its
/// initial size: `idle.len() + outstanding == pool_size` holds at every
/// observation point.
pub struct HandlePool<T> {
    state: Mutex<PoolState<T>>,
    not_empty: Condvar,
    pool_size: usize,
}

impl<T> HandlePool<T> {
    /// Build a pool from a fixed set of pre-established handles.
    ///
    /// Returns [`PoolError::Empty`] if `handles` is empty: a pool with no
    /// handles can never satisfy an `acquire`, so this is rejected at
    /// construction rather than left to hang the first caller.
    pub fn new(handles: Vec<T>) -> Result<Arc<Self>> {
        if handles.is_empty() {
            return Err(PoolError::Empty);
        }
        let pool_size = handles.len();
        Ok(Arc::new(Self {
            state: Mutex::new(PoolState {
                idle: handles.into(),
                outstanding: 0,
            }),
            not_empty: Condvar::new(),
            pool_size,
        }))
    }

    /// Number of handles this pool was created with.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Acquire a handle, blocking until one is available.
    ///
    /// The returned guard releases the handle back to the pool when
    /// dropped, on every exit path including a panicking caller.
    pub fn acquire(self: &Arc<Self>) -> PooledHandle<T> {
        let mut state = self.state.lock().unwrap();
        while state.idle.is_empty() {
            state = self.not_empty.wait(state).unwrap();
        }
        let handle = state.idle.pop_front().expect("checked non-empty above");
        state.outstanding += 1;
        drop(state);

        PooledHandle {
            handle: Some(handle),
            pool: self.clone(),
        }
    }

    fn release(&self, handle: T) {
        let mut state = self.state.lock().unwrap();
        state.idle.push_back(handle);
        state.outstanding -= 1;
        drop(state);
        self.not_empty.notify_one();
    }

    /// Point-in-time statistics, for tests and diagnostics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            idle: state.idle.len(),
            outstanding: state.outstanding,
            pool_size: self.pool_size,
        }
    }
}

/// RAII guard returned by [`HandlePool::acquire`].
///
/// Calls [`HandlePool::release`] on drop, guaranteeing the handle is
/// returned on every exit path (success, early return, or panic).
pub struct PooledHandle<T> {
    handle: Option<T>,
    pool: Arc<HandlePool<T>>,
}

impl<T> std::ops::Deref for PooledHandle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.handle.as_ref().expect("handle taken only on drop")
    }
}

impl<T> std::ops::DerefMut for PooledHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle.as_mut().expect("handle taken only on drop")
    }
}

impl<T> Drop for PooledHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub outstanding: usize,
    pub pool_size: usize,
}

impl PoolStats {
    /// Invariant checked by property tests: idle + outstanding == pool_size.
    pub fn is_consistent(&self) -> bool {
        self.idle + self.outstanding == self.pool_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn rejects_empty_pool() {
        let result = HandlePool::<i32>::new(vec![]);
        assert!(matches!(result, Err(PoolError::Empty)));
    }

    #[test]
    fn acquire_release_round_trip_is_identity() {
        let pool = HandlePool::new(vec![1, 2, 3]).unwrap();
        let before = pool.stats();

        let handle = pool.acquire();
        assert_ne!(pool.stats(), before);
        drop(handle);

        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn invariant_holds_under_concurrent_acquire() {
        let pool = HandlePool::new(vec![0usize; 4]).unwrap();
        assert!(pool.stats().is_consistent());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let p = pool.clone();
            handles.push(thread::spawn(move || {
                let h = p.acquire();
                thread::sleep(Duration::from_millis(5));
                drop(h);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = pool.stats();
        assert!(stats.is_consistent());
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.idle, 4);
    }

    #[test]
    fn fifo_order_is_not_required_but_pool_size_is_conserved() {
        let pool = HandlePool::new(vec!["a", "b"]).unwrap();
        let h1 = pool.acquire();
        let h2 = pool.acquire();
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 2);
        assert_eq!(stats.idle, 0);
        drop(h1);
        drop(h2);
        assert!(pool.stats().is_consistent());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = HandlePool::new(vec![1]).unwrap();
        let h1 = pool.acquire();

        let p2 = pool.clone();
        let acquired = Arc::new(Mutex::new(false));
        let acquired2 = acquired.clone();
        let waiter = thread::spawn(move || {
            let _h = p2.acquire();
            *acquired2.lock().unwrap() = true;
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!*acquired.lock().unwrap(), "waiter must block while pool is empty");

        drop(h1);
        waiter.join().unwrap();
        assert!(*acquired.lock().unwrap());
    }
}
