//! Shared load queue
//!
//! A thread-safe queue shared by every cache that wants background loads.
//! Submitters push tasks with a priority level; fetcher workers block on
//! [`LoadQueue::next_job_timeout`] until work arrives or the queue closes.

use crate::priority::{Job, JobId, PriorityQueue, QueuePriority};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Load queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Total jobs submitted
    pub jobs_submitted: u64,

    /// Total jobs completed (including jobs whose task panicked)
    pub jobs_completed: u64,

    /// Total jobs dropped from the queue without running
    pub jobs_dropped: u64,

    /// Current queue size
    pub queue_size: usize,
}

impl QueueStats {
    /// Jobs submitted but neither completed nor dropped (queued or running)
    pub fn pending_jobs(&self) -> u64 {
        self.jobs_submitted - self.jobs_completed - self.jobs_dropped
    }
}

struct QueueState {
    queue: PriorityQueue,
    stats: QueueStats,
    closed: bool,
}

/// Load queue with priority levels
///
/// # Example
///
/// ```
/// use volcache_scheduler::LoadQueue;
///
/// let queue = LoadQueue::new(3);
///
/// // Submit an urgent job to the front of level 0
/// let job_id = queue.submit(0, true, || println!("loading cell 42")).unwrap();
///
/// // A worker pulls and runs it
/// if let Some(job) = queue.next_job() {
///     assert_eq!(job.id, job_id);
///     job.run();
///     queue.complete_job(job_id);
/// }
/// ```
pub struct LoadQueue {
    state: Mutex<QueueState>,
    job_available: Condvar,
}

impl LoadQueue {
    /// Create a queue with `num_priorities` priority levels
    pub fn new(num_priorities: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: PriorityQueue::new(num_priorities),
                stats: QueueStats::default(),
                closed: false,
            }),
            job_available: Condvar::new(),
        }
    }

    /// Number of priority levels
    pub fn num_priorities(&self) -> usize {
        self.state.lock().queue.num_priorities()
    }

    /// Submit a task
    ///
    /// Returns the job ID, or `None` if the queue has been closed, in which
    /// case the task is dropped without running.
    pub fn submit<F>(&self, priority: QueuePriority, to_front: bool, task: F) -> Option<JobId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        let job_id = state.queue.push(priority, to_front, Box::new(task));
        state.stats.jobs_submitted += 1;
        drop(state);

        self.job_available.notify_one();
        Some(job_id)
    }

    /// Take the most urgent job without waiting
    pub fn next_job(&self) -> Option<Job> {
        self.state.lock().queue.pop()
    }

    /// Take the most urgent job, waiting up to `timeout` for one to arrive
    ///
    /// Returns `None` on timeout, when woken by [`LoadQueue::notify_all`]
    /// with nothing queued, or once the queue is closed and empty.
    pub fn next_job_timeout(&self, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if let Some(job) = state.queue.pop() {
            return Some(job);
        }
        if state.closed {
            return None;
        }

        self.job_available.wait_until(&mut state, deadline);
        state.queue.pop()
    }

    /// Like [`LoadQueue::next_job_timeout`], but returns `None` without
    /// waiting once `stop` is set
    ///
    /// The flag is checked under the queue lock, so a `stop` followed by
    /// [`LoadQueue::notify_all`] cannot be missed.
    pub(crate) fn next_job_unless_stopped(
        &self,
        timeout: Duration,
        stop: &AtomicBool,
    ) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if stop.load(Ordering::Acquire) {
            return None;
        }
        if let Some(job) = state.queue.pop() {
            return Some(job);
        }
        if state.closed {
            return None;
        }

        self.job_available.wait_until(&mut state, deadline);
        state.queue.pop()
    }

    /// Mark a job as completed
    pub fn complete_job(&self, _job_id: JobId) {
        self.state.lock().stats.jobs_completed += 1;
    }

    /// Number of queued jobs not yet taken by a worker
    pub fn pending_jobs(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Check if any job is waiting for a worker
    pub fn has_pending_jobs(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    /// Drop every queued job without running it
    ///
    /// Jobs already taken by a worker are unaffected.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.queue.clear();
        state.stats.jobs_dropped += dropped as u64;
        dropped
    }

    /// Close the queue: reject new submissions, drop queued jobs and wake
    /// every waiting worker
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.queue.clear();
        state.stats.jobs_dropped += dropped as u64;
        drop(state);

        self.job_available.notify_all();
        dropped
    }

    /// Check if the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wake every waiting worker without closing the queue
    pub fn notify_all(&self) {
        let _state = self.state.lock();
        self.job_available.notify_all();
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.queue_size = state.queue.len();
        stats
    }
}

impl Default for LoadQueue {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_submit_and_next_job() {
        let queue = LoadQueue::new(2);

        let id = queue.submit(1, false, || {}).unwrap();
        assert!(queue.has_pending_jobs());
        assert_eq!(queue.pending_jobs(), 1);

        let job = queue.next_job().unwrap();
        assert_eq!(job.id, id);
        assert!(!queue.has_pending_jobs());
    }

    #[test]
    fn test_stats_track_lifecycle() {
        let queue = LoadQueue::new(2);

        let first = queue.submit(0, false, || {}).unwrap();
        queue.submit(0, false, || {}).unwrap();
        queue.submit(1, false, || {}).unwrap();

        let job = queue.next_job().unwrap();
        assert_eq!(job.id, first);
        job.run();
        queue.complete_job(first);

        assert_eq!(queue.clear(), 2);

        let stats = queue.stats();
        assert_eq!(stats.jobs_submitted, 3);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_dropped, 2);
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.pending_jobs(), 0);
    }

    #[test]
    fn test_closed_queue_rejects_submissions() {
        let queue = LoadQueue::new(1);
        queue.submit(0, false, || {}).unwrap();

        assert_eq!(queue.close(), 1);
        assert!(queue.is_closed());
        assert!(queue.submit(0, false, || {}).is_none());
        assert!(queue.next_job().is_none());
    }

    #[test]
    fn test_next_job_timeout_returns_none_when_idle() {
        let queue = LoadQueue::new(1);

        let start = Instant::now();
        assert!(queue.next_job_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_next_job_timeout_wakes_on_submit() {
        let queue = Arc::new(LoadQueue::new(1));
        let ran = Arc::new(AtomicUsize::new(0));

        let worker_queue = queue.clone();
        let handle = thread::spawn(move || {
            worker_queue
                .next_job_timeout(Duration::from_secs(5))
                .map(|job| {
                    let id = job.id;
                    job.run();
                    id
                })
        });

        thread::sleep(Duration::from_millis(20));
        let counter = ran.clone();
        let id = queue
            .submit(0, false, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(handle.join().unwrap(), Some(id));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_wakes_waiting_workers() {
        let queue = Arc::new(LoadQueue::new(1));

        let worker_queue = queue.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let job = worker_queue.next_job_timeout(Duration::from_secs(10));
            (job.is_none(), start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        queue.close();

        let (empty, waited) = handle.join().unwrap();
        assert!(empty);
        assert!(waited < Duration::from_secs(5));
    }
}
