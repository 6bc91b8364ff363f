//! Volcache Scheduler Library
//!
//! Shared load queue and fetcher worker pool for background cell loads.
//!
//! Caches submit blocking load tasks with a priority level (0 is most
//! urgent) and a placement flag. Within one level, tasks placed at the front
//! run newest-first and tasks placed at the back run in FIFO order. A fixed
//! pool of fetcher threads drains the queue.
//!
//! # Example
//!
//! ```
//! use volcache_scheduler::{LoadQueue, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(LoadQueue::new(4));
//! let pool = WorkerPool::new(queue.clone(), WorkerPoolConfig::new(2)).unwrap();
//!
//! // A renderer missed cell 17 of level 0; fetch it in the background
//! queue.submit(0, false, move || {
//!     let _ = 17;
//! });
//!
//! pool.shutdown();
//! ```

mod priority;
mod scheduler;
mod worker;

// Re-export public API
pub use priority::{Job, JobId, QueuePriority};
pub use scheduler::{LoadQueue, QueueStats};
pub use worker::{WorkerPool, WorkerPoolConfig};
