//! Priority ordering for queued load jobs
//!
//! Jobs are ordered by queue priority (level 0 is the most urgent), then by
//! placement: jobs enqueued to the front of a level run before jobs enqueued
//! to its back. Front jobs run newest-first, back jobs run oldest-first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

/// Unique job identifier
pub type JobId = u64;

/// Queue priority level. Lower values are more urgent.
pub type QueuePriority = usize;

/// Work carried by a job
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A queued unit of background work
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Priority level, already clamped to the queue's level count
    pub priority: QueuePriority,

    /// Whether the job was placed at the front of its level
    pub to_front: bool,

    task: Task,

    /// Insertion order (FIFO at the back, LIFO at the front)
    insertion_order: u64,
}

impl Job {
    fn new(
        id: JobId,
        priority: QueuePriority,
        to_front: bool,
        task: Task,
        insertion_order: u64,
    ) -> Self {
        Self {
            id,
            priority,
            to_front,
            task,
            insertion_order,
        }
    }

    /// Consume the job and run its task on the calling thread
    pub fn run(self) {
        (self.task)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("to_front", &self.to_front)
            .field("insertion_order", &self.insertion_order)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap: "greater" jobs are popped first.
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => match self.to_front.cmp(&other.to_front) {
                Ordering::Equal if self.to_front => {
                    self.insertion_order.cmp(&other.insertion_order)
                }
                Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
                placement => placement,
            },
            priority => priority,
        }
    }
}

/// Priority queue for jobs
///
/// Not synchronized on its own; [`crate::LoadQueue`] owns one behind its lock.
pub struct PriorityQueue {
    /// Binary heap for priority-ordered jobs (max heap)
    heap: BinaryHeap<Job>,

    /// Number of priority levels; larger priorities are clamped to the last level
    num_priorities: usize,

    /// Next job ID (for automatic ID assignment)
    next_job_id: JobId,

    /// Insertion counter
    insertion_counter: u64,
}

impl PriorityQueue {
    /// Create an empty queue with `num_priorities` levels (at least one)
    pub fn new(num_priorities: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            num_priorities: num_priorities.max(1),
            next_job_id: 1,
            insertion_counter: 0,
        }
    }

    /// Number of priority levels
    pub fn num_priorities(&self) -> usize {
        self.num_priorities
    }

    /// Push a task and return its assigned job ID
    pub fn push(&mut self, priority: QueuePriority, to_front: bool, task: Task) -> JobId {
        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let insertion_order = self.insertion_counter;
        self.insertion_counter += 1;

        let priority = priority.min(self.num_priorities - 1);
        self.heap
            .push(Job::new(job_id, priority, to_front, task, insertion_order));

        job_id
    }

    /// Pop the most urgent job, or `None` if the queue is empty
    pub fn pop(&mut self) -> Option<Job> {
        self.heap.pop()
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every queued job without running it, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.heap.len();
        self.heap.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Task {
        Box::new(|| {})
    }

    fn drain_ids(queue: &mut PriorityQueue) -> Vec<JobId> {
        std::iter::from_fn(|| queue.pop()).map(|job| job.id).collect()
    }

    #[test]
    fn test_priority_queue_basic() {
        let mut queue = PriorityQueue::new(4);

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        let id1 = queue.push(0, false, noop());
        assert!(!queue.is_empty());
        assert_eq!(queue.len(), 1);

        let job = queue.pop().unwrap();
        assert_eq!(job.id, id1);
        assert_eq!(job.priority, 0);

        assert!(queue.is_empty());
    }

    #[test]
    fn test_lower_level_runs_first() {
        let mut queue = PriorityQueue::new(4);

        let ocr_like = queue.push(3, false, noop());
        let prefetch = queue.push(2, false, noop());
        let visible = queue.push(0, false, noop());
        let margin = queue.push(1, false, noop());

        assert_eq!(drain_ids(&mut queue), vec![visible, margin, prefetch, ocr_like]);
    }

    #[test]
    fn test_fifo_at_back_of_level() {
        let mut queue = PriorityQueue::new(2);

        let id1 = queue.push(1, false, noop());
        let id2 = queue.push(1, false, noop());
        let id3 = queue.push(1, false, noop());

        assert_eq!(drain_ids(&mut queue), vec![id1, id2, id3]);
    }

    #[test]
    fn test_front_jobs_run_newest_first_and_before_back_jobs() {
        let mut queue = PriorityQueue::new(2);

        let back1 = queue.push(0, false, noop());
        let front1 = queue.push(0, true, noop());
        let back2 = queue.push(0, false, noop());
        let front2 = queue.push(0, true, noop());

        assert_eq!(drain_ids(&mut queue), vec![front2, front1, back1, back2]);
    }

    #[test]
    fn test_priority_dominates_placement() {
        let mut queue = PriorityQueue::new(2);

        let urgent_back = queue.push(0, false, noop());
        let lazy_front = queue.push(1, true, noop());

        assert_eq!(drain_ids(&mut queue), vec![urgent_back, lazy_front]);
    }

    #[test]
    fn test_priority_is_clamped_to_last_level() {
        let mut queue = PriorityQueue::new(3);
        queue.push(99, false, noop());

        let job = queue.pop().unwrap();
        assert_eq!(job.priority, 2);
    }

    #[test]
    fn test_zero_levels_means_one_level() {
        let queue = PriorityQueue::new(0);
        assert_eq!(queue.num_priorities(), 1);
    }

    #[test]
    fn test_clear_drops_tasks_without_running() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let mut queue = PriorityQueue::new(1);
        let flag = ran.clone();
        queue.push(0, false, Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_job_run_executes_task() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let counter = Arc::new(AtomicUsize::new(0));
        let mut queue = PriorityQueue::new(1);
        let c = counter.clone();
        queue.push(0, false, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        queue.pop().unwrap().run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
