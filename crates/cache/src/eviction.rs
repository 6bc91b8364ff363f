//! Global eviction controller
//!
//! One controller owns the memory budget shared by every store it creates.
//! Eviction passes walk all live stores and drop their least recently used
//! cells until usage is back under the limit. A background "cache clean up"
//! thread runs a pass at a fixed interval; [`EvictionController::set_max_size`]
//! triggers one immediately.

use crate::cell::CellData;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::grid::{CellGrid, CellIndex};
use crate::memory_budget::{MemoryBudget, MemoryPressure};
use crate::store::{AccessClock, CellLoader, CellStore, StoreStats};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifier of a registered store
pub type StoreId = u64;

/// Identifier returned by [`EvictionController::subscribe`]
pub type SubscriptionId = u64;

/// One evictable cell as seen when a pass starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub store: StoreId,
    pub index: CellIndex,
    /// Recency stamp; the cell is skipped if it has been touched since
    pub last_access: u64,
    pub size: usize,
}

/// A store the controller can shrink
pub trait Evictable: Send + Sync {
    fn store_id(&self) -> StoreId;

    fn memory_used(&self) -> usize;

    /// Snapshot of every cached cell
    fn eviction_candidates(&self) -> Vec<EvictionCandidate>;

    /// Remove the candidate if it is unchanged and not being loaded,
    /// returning the bytes freed
    fn evict(&self, candidate: &EvictionCandidate) -> Option<usize>;

    fn stats(&self) -> StoreStats;
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Cells removed
    pub evicted: usize,
    /// Candidates left alone because they were touched or loading
    pub skipped: usize,
    pub bytes_freed: usize,
    pub usage_before: usize,
    pub usage_after: usize,
    pub max_size: usize,
}

impl EvictionReport {
    pub fn is_within_budget(&self) -> bool {
        self.usage_after <= self.max_size
    }
}

/// Notification sent to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    MaxSizeChanged { old: usize, new: usize },
    EvictionPass(EvictionReport),
}

/// Aggregated statistics over every live store
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub stores: usize,
    pub cell_count: usize,
    pub memory_used: usize,
    pub memory_limit: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub eviction_passes: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate memory utilization
    pub fn memory_utilization(&self) -> f64 {
        if self.memory_limit == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_limit as f64
        }
    }
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
struct ShutdownSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    fn trigger(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `timeout` or until triggered; returns whether triggered
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Memory-bounded eviction controller
///
/// # Example
///
/// ```
/// use volcache_cache::{CellGrid, CellIndex, CellInterval, EvictionController, LoadError};
/// use std::sync::Arc;
///
/// let controller = EvictionController::new(64 * 1024).unwrap();
/// let grid = Arc::new(CellGrid::new(vec![256, 256], vec![64, 64]));
/// let store = controller
///     .create_store(grid, |_i: CellIndex, interval: &CellInterval| {
///         Ok::<_, LoadError>(vec![0u8; interval.num_elements()])
///     })
///     .unwrap();
///
/// for index in 0..16 {
///     store.get(index).unwrap();
/// }
/// assert!(controller.current_memory_usage_in_bytes() > 64 * 1024);
///
/// let report = controller.restrict_to_max_size();
/// assert!(report.evicted > 0);
/// assert!(controller.current_memory_usage_in_bytes() <= 64 * 1024);
/// ```
pub struct EvictionController {
    budget: Arc<MemoryBudget>,
    clock: Arc<AccessClock>,
    stores: Mutex<HashMap<StoreId, Weak<dyn Evictable>>>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
    eviction_passes: AtomicU64,
    /// Serializes passes
    pass: Mutex<()>,
    signal: Arc<ShutdownSignal>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionController {
    /// Create a controller without a background thread
    ///
    /// # Errors
    ///
    /// Returns `InvalidMaxSize` if `max_size` is zero.
    pub fn new(max_size: usize) -> CacheResult<Self> {
        if max_size == 0 {
            return Err(CacheError::InvalidMaxSize(max_size));
        }

        Ok(Self {
            budget: Arc::new(MemoryBudget::new(max_size)),
            clock: Arc::new(AccessClock::new()),
            stores: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            eviction_passes: AtomicU64::new(0),
            pass: Mutex::new(()),
            signal: Arc::new(ShutdownSignal::default()),
            cleanup: Mutex::new(None),
        })
    }

    /// Create a controller and start its "cache clean up" thread, which runs
    /// a pass right away and then every `interval`
    pub fn create(max_size: usize, interval: Duration) -> CacheResult<Arc<Self>> {
        let controller = Arc::new(Self::new(max_size)?);
        controller.start_cleanup(interval)?;
        Ok(controller)
    }

    /// Create a controller from a [`CacheConfig`]
    pub fn from_config(config: &CacheConfig) -> CacheResult<Arc<Self>> {
        Self::create(config.max_cache_size, config.eviction_interval)
    }

    /// Start the periodic pass; a no-op if it is already running
    ///
    /// The thread holds only a weak reference, so dropping the last handle
    /// to the controller stops it.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) -> CacheResult<()> {
        if self.is_shut_down() {
            return Err(CacheError::ControllerShutDown);
        }

        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return Ok(());
        }

        let controller = Arc::downgrade(self);
        let signal = self.signal.clone();
        let handle = thread::Builder::new()
            .name("cache clean up".to_string())
            .spawn(move || run_cleanup(controller, signal, interval))
            .map_err(|e| CacheError::ThreadSpawn(Arc::new(e)))?;

        *cleanup = Some(handle);
        tracing::debug!(interval_ms = interval.as_millis() as u64, "started cache clean up thread");
        Ok(())
    }

    /// Create a store charged against this controller's budget
    ///
    /// # Errors
    ///
    /// Returns `ControllerShutDown` after [`EvictionController::shutdown`].
    pub fn create_store<A, L>(
        &self,
        grid: Arc<CellGrid>,
        loader: L,
    ) -> CacheResult<Arc<CellStore<A>>>
    where
        A: CellData,
        L: CellLoader<A> + 'static,
    {
        if self.is_shut_down() {
            return Err(CacheError::ControllerShutDown);
        }

        let store = Arc::new(CellStore::with_accounting(
            grid,
            Arc::new(loader),
            self.budget.clone(),
            self.clock.clone(),
        ));
        self.register(store.clone());
        Ok(store)
    }

    fn register(&self, store: Arc<dyn Evictable>) {
        let id = store.store_id();
        let mut stores = self.stores.lock();
        stores.retain(|_, store| store.strong_count() > 0);
        stores.insert(id, Arc::downgrade(&store));
        tracing::debug!(store = id, stores = stores.len(), "registered store");
    }

    /// Number of live registered stores
    pub fn num_stores(&self) -> usize {
        self.live_stores().len()
    }

    /// Evict least recently used cells across all stores until usage is
    /// within the limit
    ///
    /// Cells that are being loaded, or that are touched while the pass runs,
    /// are skipped, so usage can remain above the limit afterwards.
    pub fn restrict_to_max_size(&self) -> EvictionReport {
        let pass = self.pass.lock();
        let max_size = self.budget.max_size();
        let usage_before = self.budget.current_usage();
        let mut report = EvictionReport {
            usage_before,
            usage_after: usage_before,
            max_size,
            ..Default::default()
        };

        if usage_before > max_size {
            let stores: HashMap<StoreId, Arc<dyn Evictable>> = self
                .live_stores()
                .into_iter()
                .map(|store| (store.store_id(), store))
                .collect();

            let mut candidates: Vec<EvictionCandidate> = stores
                .values()
                .flat_map(|store| store.eviction_candidates())
                .collect();
            candidates.sort_unstable_by_key(|candidate| candidate.last_access);

            for candidate in &candidates {
                if !self.budget.is_over_budget() {
                    break;
                }
                let freed = stores
                    .get(&candidate.store)
                    .and_then(|store| store.evict(candidate));
                match freed {
                    Some(bytes) => {
                        report.evicted += 1;
                        report.bytes_freed += bytes;
                    }
                    None => report.skipped += 1,
                }
            }

            report.usage_after = self.budget.current_usage();
            tracing::debug!(
                evicted = report.evicted,
                skipped = report.skipped,
                bytes_freed = report.bytes_freed,
                usage = report.usage_after,
                max_size,
                "eviction pass"
            );
            if !report.is_within_budget() {
                tracing::warn!(
                    usage = report.usage_after,
                    max_size,
                    "cache still over budget after eviction pass"
                );
            }
        }

        self.eviction_passes.fetch_add(1, Ordering::Relaxed);
        drop(pass);

        self.notify(&CacheEvent::EvictionPass(report));
        report
    }

    /// Change the limit and run a pass at once
    ///
    /// # Errors
    ///
    /// Returns `InvalidMaxSize` if `bytes` is zero; the limit is unchanged.
    pub fn set_max_size(&self, bytes: usize) -> CacheResult<EvictionReport> {
        if bytes == 0 {
            return Err(CacheError::InvalidMaxSize(bytes));
        }

        let old = self.budget.set_max_size(bytes);
        tracing::info!(old, new = bytes, "cache size limit changed");
        self.notify(&CacheEvent::MaxSizeChanged { old, new: bytes });
        Ok(self.restrict_to_max_size())
    }

    pub fn max_size(&self) -> usize {
        self.budget.max_size()
    }

    pub fn current_memory_usage_in_bytes(&self) -> usize {
        self.budget.current_usage()
    }

    pub fn pressure(&self) -> MemoryPressure {
        self.budget.pressure()
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Register a callback for [`CacheEvent`]s
    ///
    /// Callbacks run on the thread that caused the event, without any
    /// controller lock held.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Aggregate statistics over every live store
    pub fn stats(&self) -> CacheStats {
        let stores = self.live_stores();
        let mut stats = CacheStats {
            stores: stores.len(),
            memory_used: self.budget.current_usage(),
            memory_limit: self.budget.max_size(),
            eviction_passes: self.eviction_passes.load(Ordering::Relaxed),
            ..Default::default()
        };

        for store in stores {
            let store_stats = store.stats();
            stats.cell_count += store_stats.cell_count;
            stats.hits += store_stats.hits;
            stats.misses += store_stats.misses;
            stats.loads += store_stats.loads;
            stats.load_failures += store_stats.load_failures;
            stats.evictions += store_stats.evictions;
        }
        stats
    }

    /// Stop the clean up thread and refuse new stores
    ///
    /// Existing stores keep working but are no longer evicted from.
    pub fn shutdown(&self) {
        self.signal.trigger();

        let handle = self.cleanup.lock().take();
        if let Some(handle) = handle {
            // The last handle can be dropped by the clean up thread itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("cache clean up thread panicked");
            }
        }
        tracing::debug!("eviction controller shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.signal.is_triggered()
    }

    fn live_stores(&self) -> Vec<Arc<dyn Evictable>> {
        let mut stores = self.stores.lock();
        stores.retain(|_, store| store.strong_count() > 0);
        stores.values().filter_map(Weak::upgrade).collect()
    }

    fn notify(&self, event: &CacheEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

impl Drop for EvictionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_cleanup(controller: Weak<EvictionController>, signal: Arc<ShutdownSignal>, interval: Duration) {
    while !signal.is_triggered() {
        match controller.upgrade() {
            Some(controller) => {
                controller.restrict_to_max_size();
            }
            None => break,
        }
        if signal.wait(interval) {
            break;
        }
    }
}
