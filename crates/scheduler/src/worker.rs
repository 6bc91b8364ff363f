//! Fetcher worker pool for parallel background loads.
//!
//! A fixed number of worker threads pull jobs from a shared [`LoadQueue`]
//! and run them. A job that panics is logged and counted as completed; it
//! never takes its worker down.

use crate::LoadQueue;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration for the fetcher worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to spawn.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// Maximum time a worker waits for a job before re-checking shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration (at least one worker).
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Set the poll interval for workers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Fetcher worker pool.
///
/// # Example
///
/// ```
/// use volcache_scheduler::{LoadQueue, WorkerPool, WorkerPoolConfig};
/// use std::sync::Arc;
///
/// let queue = Arc::new(LoadQueue::new(2));
/// let pool = WorkerPool::new(queue.clone(), WorkerPoolConfig::new(2)).unwrap();
///
/// queue.submit(0, false, || {
///     // blocking read + decode of one cell
/// });
///
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    queue: Arc<LoadQueue>,
    workers: Vec<Worker>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Create and start a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned; workers that
    /// were already started are stopped again.
    pub fn new(queue: Arc<LoadQueue>, config: WorkerPoolConfig) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            queue: queue.clone(),
            workers: Vec::with_capacity(config.num_workers),
            shutdown: shutdown.clone(),
        };

        for id in 0..config.num_workers {
            let worker = Worker::spawn(id, queue.clone(), shutdown.clone(), config.poll_interval)?;
            pool.workers.push(worker);
        }

        tracing::debug!(workers = pool.workers.len(), "started fetcher pool");
        Ok(pool)
    }

    /// Get the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Check if the worker pool is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Shutdown the worker pool gracefully.
    ///
    /// Workers finish the job they are running and exit. Jobs still queued
    /// stay in the queue. Blocks until every worker has terminated.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.notify_all();

        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// A single worker thread in the worker pool.
struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        queue: Arc<LoadQueue>,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("volcache-fetcher-{}", id))
            .spawn(move || Self::run(queue, shutdown, poll_interval))?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    /// Main worker loop.
    fn run(queue: Arc<LoadQueue>, shutdown: Arc<AtomicBool>, poll_interval: Duration) {
        while !shutdown.load(Ordering::Acquire) {
            let Some(job) = queue.next_job_unless_stopped(poll_interval, &shutdown) else {
                if queue.is_closed() {
                    break;
                }
                continue;
            };

            let job_id = job.id;
            if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
                tracing::error!(job_id, "load job panicked");
            }
            queue.complete_job(job_id);
        }
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker = self.id, "fetcher thread panicked");
            }
        }
    }
}

/// Get the number of logical CPU cores.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
