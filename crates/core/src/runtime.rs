//! Cache runtime context
//!
//! Owns the pieces every pyramid level shares: the eviction controller with
//! its memory budget and cleanup timer, the load queue, and the fetcher pool
//! draining it. Pass a runtime to [`load_multiscale`](crate::load_multiscale)
//! for every dataset that should share one budget.

use crate::error::RuntimeError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};
use volcache_cache::{CacheConfig, EvictionController};
use volcache_scheduler::{LoadQueue, WorkerPool, WorkerPoolConfig};

pub struct CacheRuntime {
    config: CacheConfig,
    queue: Arc<LoadQueue>,
    pool: Mutex<Option<WorkerPool>>,
    controller: Arc<EvictionController>,
}

impl CacheRuntime {
    /// Validate `config`, then start the eviction timer and fetcher threads
    pub fn start(config: CacheConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let controller = EvictionController::from_config(&config)?;
        let queue = Arc::new(LoadQueue::new(config.num_priorities));
        let pool = match WorkerPool::new(queue.clone(), WorkerPoolConfig::new(config.num_fetcher_threads)) {
            Ok(pool) => pool,
            Err(err) => {
                controller.shutdown();
                return Err(RuntimeError::Workers(err));
            }
        };

        info!(
            max_cache_mb = config.max_cache_mb(),
            fetchers = pool.num_workers(),
            priorities = config.num_priorities,
            "cache runtime started"
        );

        Ok(Self {
            config,
            queue,
            pool: Mutex::new(Some(pool)),
            controller,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<LoadQueue> {
        &self.queue
    }

    pub fn controller(&self) -> &Arc<EvictionController> {
        &self.controller
    }

    /// Check whether [`CacheRuntime::shutdown`] has run
    pub fn is_shut_down(&self) -> bool {
        self.pool.lock().is_none()
    }

    /// Drop queued loads, join the fetchers and stop the eviction timer
    ///
    /// Loads already running finish first. Calling this twice is harmless.
    pub fn shutdown(&self) {
        let Some(pool) = self.pool.lock().take() else {
            return;
        };

        let dropped = self.queue.close();
        pool.shutdown();
        self.controller.shutdown();
        debug!(dropped, "cache runtime shut down");
    }
}

impl Drop for CacheRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
