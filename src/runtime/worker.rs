//! Fixed-size pool of worker threads.
//!
//! Every worker blocks on the shared [`JobQueue`] and runs jobs in FIFO
//! order. A panicking job is logged and the worker keeps going.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::SubmitError;
use crate::runtime::queue::JobQueue;
use crate::sync::{RawSpinlock, Spinlock};

/// A fixed number of OS threads executing submitted closures.
///
/// ```
/// use std::sync::mpsc;
/// use tasktimer::WorkerPool;
///
/// let pool = WorkerPool::new(2, None, "doc").unwrap();
/// let (tx, rx) = mpsc::channel();
/// pool.submit(move || tx.send(7).unwrap()).unwrap();
/// assert_eq!(rx.recv().unwrap(), 7);
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    workers: Spinlock<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers named `{name}-worker-{i}`.
    ///
    /// `capacity` bounds how many jobs may wait in the queue; `None` means unbounded.
    pub fn new(size: usize, capacity: Option<usize>, name: &str) -> io::Result<Self> {
        let size = size.max(1);
        let queue = Arc::new(JobQueue::new(capacity));
        let pool = Self {
            queue: queue.clone(),
            workers: Spinlock::from_raw(RawSpinlock::named("worker_pool"), Vec::with_capacity(size)),
            size,
        };

        for index in 0..size {
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || work(&queue))?;
            pool.workers.lock().push(handle);
        }

        tracing::info!(workers = size, ?capacity, "worker pool started");
        Ok(pool)
    }

    /// Queues `job`, failing if the queue is full or the pool is shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        self.queue.push(Box::new(job))
    }

    /// Queues `job` even if the queue is at capacity.
    pub fn submit_unbounded(&self, job: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        self.queue.push_unbounded(Box::new(job))
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of worker threads the pool was started with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Checks if the pool has stopped accepting jobs.
    ///
    /// # Returns
    /// true once [`WorkerPool::shutdown`] has been called, false otherwise
    pub fn is_shutdown(&self) -> bool {
        self.queue.is_shutdown()
    }

    /// Rejects new jobs, lets the workers finish everything already queued,
    /// then joins them.
    ///
    /// A worker calling this does not join itself; it exits once its current
    /// job returns.
    pub fn shutdown(&self) {
        self.queue.shutdown();

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        for _ in 0..workers.len() {
            self.queue.push_stop();
        }

        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside a job");
            }
        }

        tracing::info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(queue: &JobQueue) {
    while let Some(job) = queue.pop() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("job panicked");
        }
    }
}
