//! Blocking cell store
//!
//! Maps cell indices to loaded cells. A miss runs the store's loader on the
//! calling thread; concurrent requests for the same index share one load.
//! Cached cells stay resident until an eviction controller (or an explicit
//! invalidation) removes them.

use crate::cell::{Cell, CellData};
use crate::error::{CacheError, CacheResult, LoadError};
use crate::eviction::{Evictable, EvictionCandidate, StoreId};
use crate::grid::{CellGrid, CellIndex, CellInterval};
use crate::memory_budget::MemoryBudget;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Produces the payload of one cell
///
/// Loaders run on arbitrary threads, possibly several at once for different
/// indices. They are never called twice concurrently for the same index of
/// one store.
pub trait CellLoader<A>: Send + Sync {
    fn load(&self, index: CellIndex, interval: &CellInterval) -> Result<A, LoadError>;
}

impl<A, F> CellLoader<A> for F
where
    F: Fn(CellIndex, &CellInterval) -> Result<A, LoadError> + Send + Sync,
{
    fn load(&self, index: CellIndex, interval: &CellInterval) -> Result<A, LoadError> {
        self(index, interval)
    }
}

/// Monotonic recency clock
///
/// Stores sharing a clock can compare access times, which gives one LRU
/// order across all of them.
#[derive(Debug, Default)]
pub struct AccessClock {
    now: AtomicU64,
}

impl AccessClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock and return the new time
    pub fn tick(&self) -> u64 {
        self.now.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Statistics about one store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of cells currently cached
    pub cell_count: usize,

    /// Bytes charged for cached cells
    pub memory_used: usize,

    /// Lookups answered from the cache
    pub hits: u64,

    /// Lookups that found no cached cell
    pub misses: u64,

    /// Loader invocations
    pub loads: u64,

    /// Loader invocations that failed
    pub load_failures: u64,

    /// Cells removed by eviction passes
    pub evictions: u64,
}

impl StoreStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
}

struct Entry<A> {
    cell: Arc<Cell<A>>,
    size: usize,
    last_access: AtomicU64,
}

/// Rendezvous for callers waiting on one in-flight load
struct InFlight<A> {
    result: Mutex<Option<CacheResult<Arc<Cell<A>>>>>,
    done: Condvar,
    /// Set when the index was invalidated while loading; the result is
    /// still delivered to waiters but not cached
    stale: AtomicBool,
}

impl<A> InFlight<A> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
            stale: AtomicBool::new(false),
        }
    }

    fn wait(&self) -> CacheResult<Arc<Cell<A>>> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn publish(&self, result: CacheResult<Arc<Cell<A>>>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }
}

/// Completes a load with an error if the loader unwinds
struct LoadGuard<'a, A: CellData> {
    store: &'a CellStore<A>,
    index: CellIndex,
    slot: &'a Arc<InFlight<A>>,
    finished: bool,
}

impl<A: CellData> Drop for LoadGuard<'_, A> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(store = self.store.id, index = self.index, "cell loader panicked");
            let error = CacheError::LoadFailed {
                index: self.index,
                source: LoadError::Other("cell loader panicked".to_string()),
            };
            self.store.finish_load(self.index, self.slot, Err(error));
        }
    }
}

/// Loader-backed cell store
///
/// # Example
///
/// ```
/// use volcache_cache::{CellGrid, CellIndex, CellInterval, CellStore, LoadError};
/// use std::sync::Arc;
///
/// let grid = Arc::new(CellGrid::new(vec![100, 100], vec![32, 32]));
/// let store = CellStore::new(grid, |_index: CellIndex, interval: &CellInterval| {
///     Ok::<_, LoadError>(vec![0u8; interval.num_elements()])
/// });
///
/// let cell = store.get(15).unwrap();
/// assert_eq!(cell.dimensions(), &[4, 4]);
/// assert!(store.get_if_present(15).is_some());
/// ```
pub struct CellStore<A> {
    id: StoreId,
    grid: Arc<CellGrid>,
    loader: Arc<dyn CellLoader<A>>,
    entries: RwLock<HashMap<CellIndex, Entry<A>>>,
    /// Lock order: `in_flight` before `entries`
    in_flight: Mutex<HashMap<CellIndex, Arc<InFlight<A>>>>,
    memory_used: AtomicUsize,
    budget: Arc<MemoryBudget>,
    clock: Arc<AccessClock>,
    counters: Counters,
}

impl<A: CellData> CellStore<A> {
    /// Create a standalone store with its own unbounded budget
    pub fn new<L>(grid: Arc<CellGrid>, loader: L) -> Self
    where
        L: CellLoader<A> + 'static,
    {
        Self::with_accounting(
            grid,
            Arc::new(loader),
            Arc::new(MemoryBudget::unbounded()),
            Arc::new(AccessClock::new()),
        )
    }

    /// Create a store that charges a shared budget and clock
    pub(crate) fn with_accounting(
        grid: Arc<CellGrid>,
        loader: Arc<dyn CellLoader<A>>,
        budget: Arc<MemoryBudget>,
        clock: Arc<AccessClock>,
    ) -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            grid,
            loader,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            memory_used: AtomicUsize::new(0),
            budget,
            clock,
            counters: Counters::default(),
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn grid(&self) -> &Arc<CellGrid> {
        &self.grid
    }

    /// Get the cell at `index`, loading it on this thread if needed
    ///
    /// If another thread is already loading the index, waits for that load
    /// instead of starting a second one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIndex` for indices outside the grid and `LoadFailed`
    /// when the loader fails. Failures are not cached; the next call retries.
    pub fn get(&self, index: CellIndex) -> CacheResult<Arc<Cell<A>>> {
        if !self.grid.contains_index(index) {
            return Err(CacheError::InvalidIndex {
                index,
                num_cells: self.grid.num_cells(),
            });
        }

        if let Some(cell) = self.lookup(index) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cell);
        }

        let (slot, leader) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&index) {
                Some(slot) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    (slot.clone(), false)
                }
                None => {
                    // A load may have completed since the lookup above
                    if let Some(cell) = self.lookup(index) {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(cell);
                    }
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    let slot = Arc::new(InFlight::new());
                    in_flight.insert(index, slot.clone());
                    (slot, true)
                }
            }
        };

        if leader {
            self.load(index, &slot)
        } else {
            slot.wait()
        }
    }

    /// Get the cell at `index` only if it is cached
    ///
    /// Never loads and never waits for an in-flight load.
    pub fn get_if_present(&self, index: CellIndex) -> Option<Arc<Cell<A>>> {
        let cell = self.lookup(index);
        let counter = if cell.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        cell
    }

    /// Check whether `index` is cached, without touching its recency
    pub fn contains(&self, index: CellIndex) -> bool {
        self.entries.read().contains_key(&index)
    }

    /// Check whether a load of `index` is running
    pub fn is_loading(&self, index: CellIndex) -> bool {
        self.in_flight.lock().contains_key(&index)
    }

    /// Drop the cached cell at `index`
    ///
    /// A load of `index` that is running right now still completes for its
    /// callers, but its result is not cached.
    pub fn invalidate(&self, index: CellIndex) {
        let removed = {
            let in_flight = self.in_flight.lock();
            if let Some(slot) = in_flight.get(&index) {
                slot.stale.store(true, Ordering::Release);
            }
            self.entries.write().remove(&index)
        };

        if let Some(entry) = removed {
            self.release(entry.size);
        }
    }

    /// Drop every cached cell
    pub fn invalidate_all(&self) {
        let removed: Vec<Entry<A>> = {
            let in_flight = self.in_flight.lock();
            for slot in in_flight.values() {
                slot.stale.store(true, Ordering::Release);
            }
            self.entries.write().drain().map(|(_, entry)| entry).collect()
        };

        let freed: usize = removed.iter().map(|entry| entry.size).sum();
        self.release(freed);
        tracing::debug!(store = self.id, cells = removed.len(), freed, "invalidated store");
    }

    /// Number of cached cells
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Bytes charged for cached cells
    pub fn memory_used(&self) -> usize {
        self.memory_used.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            cell_count: self.len(),
            memory_used: self.memory_used(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            load_failures: self.counters.load_failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, index: CellIndex) -> Option<Arc<Cell<A>>> {
        let entries = self.entries.read();
        let entry = entries.get(&index)?;
        entry.last_access.store(self.clock.tick(), Ordering::Release);
        Some(entry.cell.clone())
    }

    fn load(&self, index: CellIndex, slot: &Arc<InFlight<A>>) -> CacheResult<Arc<Cell<A>>> {
        let mut guard = LoadGuard {
            store: self,
            index,
            slot,
            finished: false,
        };
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(store = self.id, index, "loading cell");

        let result = match self.grid.cell_interval_of(index) {
            Some(interval) => match self.loader.load(index, &interval) {
                Ok(data) => Ok(Arc::new(Cell::new(interval, data))),
                Err(source) => {
                    self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(store = self.id, index, error = %source, "cell load failed");
                    Err(CacheError::LoadFailed { index, source })
                }
            },
            None => Err(CacheError::InvalidIndex {
                index,
                num_cells: self.grid.num_cells(),
            }),
        };

        guard.finished = true;
        self.finish_load(index, slot, result.clone());
        result
    }

    /// Cache a successful result, retire the in-flight slot and wake waiters
    fn finish_load(
        &self,
        index: CellIndex,
        slot: &Arc<InFlight<A>>,
        result: CacheResult<Arc<Cell<A>>>,
    ) {
        {
            let mut in_flight = self.in_flight.lock();
            if let Ok(cell) = &result {
                if !slot.stale.load(Ordering::Acquire) {
                    self.insert(index, cell.clone());
                }
            }
            if in_flight
                .get(&index)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                in_flight.remove(&index);
            }
        }

        slot.publish(result);
    }

    fn insert(&self, index: CellIndex, cell: Arc<Cell<A>>) {
        let size = cell.memory_size();
        let entry = Entry {
            cell,
            size,
            last_access: AtomicU64::new(self.clock.tick()),
        };

        self.memory_used.fetch_add(size, Ordering::AcqRel);
        self.budget.record_allocation(size);

        let replaced = self.entries.write().insert(index, entry);
        if let Some(old) = replaced {
            self.release(old.size);
        }
    }

    fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.memory_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            })
            .ok();
        self.budget.record_deallocation(bytes);
    }
}

impl<A: CellData> Evictable for CellStore<A> {
    fn store_id(&self) -> StoreId {
        self.id
    }

    fn memory_used(&self) -> usize {
        CellStore::memory_used(self)
    }

    fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        self.entries
            .read()
            .iter()
            .map(|(&index, entry)| EvictionCandidate {
                store: self.id,
                index,
                last_access: entry.last_access.load(Ordering::Acquire),
                size: entry.size,
            })
            .collect()
    }

    fn evict(&self, candidate: &EvictionCandidate) -> Option<usize> {
        let removed = {
            let in_flight = self.in_flight.lock();
            if in_flight.contains_key(&candidate.index) {
                return None;
            }

            let mut entries = self.entries.write();
            let entry = entries.get(&candidate.index)?;
            // Touched since the candidate list was taken
            if entry.last_access.load(Ordering::Acquire) != candidate.last_access {
                return None;
            }
            entries.remove(&candidate.index)?
        };

        self.release(removed.size);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        Some(removed.size)
    }

    fn stats(&self) -> StoreStats {
        CellStore::stats(self)
    }
}

impl<A> Drop for CellStore<A> {
    fn drop(&mut self) {
        let used = *self.memory_used.get_mut();
        if used > 0 {
            self.budget.record_deallocation(used);
        }
    }
}
