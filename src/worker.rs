//! Bounded work queue and thread pool dispatch (§4.3/§4.4).
//!
//! The source's `threadpool<T>` guards a `std::list` with a mutex and a
//! counting semaphore; `crossbeam_channel::bounded` gives the same
//! discipline for free — `try_send` on a full channel returns an error
//! instead of growing unbounded, and `recv` blocks a worker until a job (or
//! shutdown) arrives.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvError, Sender, TrySendError};
use tracing::warn;

/// One unit of work handed from the event loop to a worker thread.
///
/// `Readable`/`Writable` carry a bare fd: the worker performs the I/O
/// itself (Reactor mode, §4.4). `Ready` carries a fd whose I/O the event
/// loop already performed inline; the worker only runs application logic
/// (Proactor mode).
pub enum Job {
    Readable(i32),
    Writable(i32),
    Ready(i32),
}

/// Error returned when the queue is at capacity. The source's `append`
/// returns `false` in this case; callers here fail the enqueue the same
/// way rather than blocking the epoll thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("work queue is full")]
pub struct QueueFull;

/// Owns the bounded queue and the pool of worker threads draining it.
/// Dropping every `Sender` clone (done by `shutdown`) lets workers observe
/// `RecvError` and exit cleanly.
pub struct WorkerPool {
    sender: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers, each running `handler` for every job it
    /// receives. `capacity` bounds the queue (`-q`).
    pub fn new<F>(threads: u16, capacity: usize, handler: F) -> Self
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let handler = Arc::new(handler);

        let handles = (0..threads)
            .map(|id| spawn_worker(id, receiver.clone(), handler.clone()))
            .collect();

        Self { sender, handles }
    }

    /// Enqueue a job. Returns `Err(QueueFull)` without blocking if the
    /// queue is saturated, matching the source's `append`'s capacity check.
    pub fn dispatch(&self, job: Job) -> Result<(), QueueFull> {
        self.sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => QueueFull,
            TrySendError::Disconnected(_) => QueueFull,
        })
    }

    /// Drops the send side and joins every worker. Called once, from
    /// `main`, after the event loop returns.
    pub fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn spawn_worker<F>(id: u16, receiver: Receiver<Job>, handler: Arc<F>) -> JoinHandle<()>
where
    F: Fn(Job) + Send + Sync + 'static,
{
    thread::Builder::new()
        .name(format!("tinyhttpd-worker-{id}"))
        .spawn(move || loop {
            match receiver.recv() {
                Ok(job) => handler(job),
                Err(RecvError) => break,
            }
        })
        .expect("failed to spawn worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[test]
    fn dispatched_jobs_reach_a_worker() {
        let seen = StdArc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let pool = WorkerPool::new(2, 8, move |_job| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        for fd in 0..5 {
            pool.dispatch(Job::Ready(fd)).unwrap();
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        pool.shutdown();
    }

    #[test]
    fn full_queue_is_rejected_without_blocking() {
        let (tx_started, rx_started) = crossbeam_channel::bounded::<()>(0);
        let (tx_release, rx_release) = crossbeam_channel::bounded::<()>(0);

        let pool = WorkerPool::new(1, 1, move |_job| {
            let _ = tx_started.send(());
            let _ = rx_release.recv();
        });

        // First job occupies the sole worker; second fills the 1-slot queue.
        pool.dispatch(Job::Ready(1)).unwrap();
        rx_started.recv().unwrap();
        pool.dispatch(Job::Ready(2)).unwrap();

        let err = pool.dispatch(Job::Ready(3));
        assert_eq!(err, Err(QueueFull));

        let _ = tx_release.send(());
        pool.shutdown();
    }
}
