//! Non-blocking view of a cell store
//!
//! A renderer asks for cells through [`VolatileCache::get_volatile`] and
//! always gets an answer at once: the real cell if it is cached, otherwise a
//! placeholder while the load is handed to the shared fetcher queue. Once the
//! load lands, later requests return the real cell.

use crate::cell::{Cell, CellData, VolatileCell};
use crate::error::CacheResult;
use crate::grid::CellIndex;
use crate::invalid::CreateInvalid;
use crate::store::CellStore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use volcache_scheduler::{LoadQueue, QueuePriority};

const MIN_PLACEHOLDER_PRUNE: usize = 1024;

/// What to do when a requested cell is not cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadingStrategy {
    /// Return a placeholder and load in the background
    Volatile,
    /// Load on the calling thread and return the real cell
    Blocking,
    /// Return a placeholder without loading
    DontLoad,
}

/// Per-request loading hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHints {
    pub loading_strategy: LoadingStrategy,
    /// Load queue level, 0 is most urgent
    pub queue_priority: QueuePriority,
    /// Place the load at the front of its level
    pub enqueue_to_front: bool,
}

impl CacheHints {
    pub fn new(
        loading_strategy: LoadingStrategy,
        queue_priority: QueuePriority,
        enqueue_to_front: bool,
    ) -> Self {
        Self {
            loading_strategy,
            queue_priority,
            enqueue_to_front,
        }
    }

    /// Background loading at `priority`, queued at the back
    pub fn volatile(priority: QueuePriority) -> Self {
        Self::new(LoadingStrategy::Volatile, priority, false)
    }

    pub fn blocking() -> Self {
        Self::new(LoadingStrategy::Blocking, 0, false)
    }

    pub fn dont_load() -> Self {
        Self::new(LoadingStrategy::DontLoad, 0, false)
    }
}

impl Default for CacheHints {
    fn default() -> Self {
        Self::volatile(0)
    }
}

/// Weakly held placeholders, so repeated misses on one index can share a
/// placeholder for as long as a renderer keeps it alive
struct Placeholders<A> {
    cells: HashMap<CellIndex, Weak<Cell<A>>>,
    prune_at: usize,
}

impl<A> Placeholders<A> {
    fn new() -> Self {
        Self {
            cells: HashMap::new(),
            prune_at: MIN_PLACEHOLDER_PRUNE,
        }
    }

    fn get(&self, index: CellIndex) -> Option<Arc<Cell<A>>> {
        self.cells.get(&index).and_then(Weak::upgrade)
    }

    fn insert(&mut self, index: CellIndex, cell: &Arc<Cell<A>>) {
        self.cells.insert(index, Arc::downgrade(cell));
        if self.cells.len() >= self.prune_at {
            self.cells.retain(|_, cell| cell.strong_count() > 0);
            self.prune_at = (self.cells.len() * 2).max(MIN_PLACEHOLDER_PRUNE);
        }
    }

    fn clear(&mut self) {
        self.cells.clear();
        self.prune_at = MIN_PLACEHOLDER_PRUNE;
    }
}

/// Clears an index from the pending set when its background job finishes,
/// even if the loader panicked
struct PendingGuard {
    pending: Arc<Mutex<HashSet<CellIndex>>>,
    index: CellIndex,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.index);
    }
}

/// Volatile cache over a [`CellStore`]
///
/// # Example
///
/// ```
/// use volcache_cache::{
///     CacheHints, Cell, CellGrid, CellIndex, CellInterval, CellStore, LoadError, VolatileCache,
/// };
/// use volcache_scheduler::LoadQueue;
/// use std::sync::Arc;
///
/// let grid = Arc::new(CellGrid::new(vec![64], vec![16]));
/// let store = Arc::new(CellStore::new(grid.clone(), |_i: CellIndex, interval: &CellInterval| {
///     Ok::<_, LoadError>(vec![1u8; interval.num_elements()])
/// }));
/// let placeholder = move |index: CellIndex| {
///     let interval = grid.cell_interval_of(index).unwrap();
///     let len = interval.num_elements();
///     Cell::new(interval, vec![0u8; len])
/// };
/// let queue = Arc::new(LoadQueue::new(2));
/// let cache = VolatileCache::new(store, Arc::new(placeholder), queue.clone(), CacheHints::default());
///
/// // Nothing cached yet: placeholder now, load queued
/// let cell = cache.get_volatile(2, cache.default_hints());
/// assert!(!cell.is_valid());
/// assert_eq!(queue.pending_jobs(), 1);
///
/// // Run the queued load by hand; the next request sees real data
/// queue.next_job().unwrap().run();
/// assert!(cache.get_volatile(2, cache.default_hints()).is_valid());
/// ```
pub struct VolatileCache<A> {
    store: Arc<CellStore<A>>,
    create_invalid: Arc<dyn CreateInvalid<A>>,
    queue: Arc<LoadQueue>,
    default_hints: CacheHints,
    pending: Arc<Mutex<HashSet<CellIndex>>>,
    placeholders: Mutex<Placeholders<A>>,
}

impl<A: CellData> VolatileCache<A> {
    pub fn new(
        store: Arc<CellStore<A>>,
        create_invalid: Arc<dyn CreateInvalid<A>>,
        queue: Arc<LoadQueue>,
        default_hints: CacheHints,
    ) -> Self {
        Self {
            store,
            create_invalid,
            queue,
            default_hints,
            pending: Arc::new(Mutex::new(HashSet::new())),
            placeholders: Mutex::new(Placeholders::new()),
        }
    }

    pub fn store(&self) -> &Arc<CellStore<A>> {
        &self.store
    }

    pub fn default_hints(&self) -> CacheHints {
        self.default_hints
    }

    /// Get a cell without waiting for I/O (unless `hints` asks to block)
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the store's grid.
    pub fn get_volatile(&self, index: CellIndex, hints: CacheHints) -> VolatileCell<A> {
        let grid = self.store.grid();
        assert!(
            grid.contains_index(index),
            "cell index {} outside grid with {} cells",
            index,
            grid.num_cells()
        );

        if let Some(cell) = self.store.get_if_present(index) {
            return VolatileCell::valid(cell);
        }

        match hints.loading_strategy {
            LoadingStrategy::Blocking => match self.store.get(index) {
                Ok(cell) => return VolatileCell::valid(cell),
                Err(err) => {
                    tracing::warn!(store = self.store.id(), index, error = %err, "blocking load failed");
                }
            },
            LoadingStrategy::Volatile => self.enqueue(index, hints),
            LoadingStrategy::DontLoad => {}
        }

        VolatileCell::invalid(self.placeholder(index))
    }

    /// Get the real cell, loading on this thread if needed
    pub fn get(&self, index: CellIndex) -> CacheResult<Arc<Cell<A>>> {
        self.store.get(index)
    }

    /// Check whether a background load of `index` is queued or running
    pub fn is_pending(&self, index: CellIndex) -> bool {
        self.pending.lock().contains(&index)
    }

    /// Number of background loads queued or running
    pub fn pending_loads(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop the cached cell at `index` together with its placeholder
    pub fn invalidate(&self, index: CellIndex) {
        self.placeholders.lock().cells.remove(&index);
        self.store.invalidate(index);
    }

    /// Drop every cached cell and placeholder
    pub fn invalidate_all(&self) {
        self.placeholders.lock().clear();
        self.store.invalidate_all();
    }

    fn enqueue(&self, index: CellIndex, hints: CacheHints) {
        if !self.pending.lock().insert(index) {
            return;
        }

        let guard = PendingGuard {
            pending: self.pending.clone(),
            index,
        };
        let store = self.store.clone();
        let submitted = self.queue.submit(hints.queue_priority, hints.enqueue_to_front, move || {
            let _guard = guard;
            if let Err(err) = store.get(index) {
                tracing::warn!(store = store.id(), index, error = %err, "background load failed");
            }
        });

        if submitted.is_none() {
            tracing::debug!(store = self.store.id(), index, "load queue closed, load dropped");
        }
    }

    fn placeholder(&self, index: CellIndex) -> Arc<Cell<A>> {
        let mut placeholders = self.placeholders.lock();
        if let Some(cell) = placeholders.get(index) {
            return cell;
        }

        let cell = Arc::new(self.create_invalid.create_invalid(index));
        placeholders.insert(index, &cell);
        cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::grid::{CellGrid, CellInterval};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        cache: VolatileCache<Vec<u8>>,
        queue: Arc<LoadQueue>,
        loads: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let grid = Arc::new(CellGrid::new(vec![100, 100, 100], vec![32, 32, 32]));
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let store = Arc::new(CellStore::new(
            grid.clone(),
            move |_index: CellIndex, interval: &CellInterval| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, LoadError>(vec![1u8; interval.num_elements()])
            },
        ));
        let create_invalid = move |index: CellIndex| {
            let interval = grid.cell_interval_of(index).unwrap();
            let len = interval.num_elements();
            Cell::new(interval, vec![0u8; len])
        };
        let queue = Arc::new(LoadQueue::new(4));
        let cache = VolatileCache::new(
            store,
            Arc::new(create_invalid),
            queue.clone(),
            CacheHints::default(),
        );

        Fixture {
            cache,
            queue,
            loads,
        }
    }

    fn drain(queue: &LoadQueue) -> usize {
        let mut ran = 0;
        while let Some(job) = queue.next_job() {
            let id = job.id;
            job.run();
            queue.complete_job(id);
            ran += 1;
        }
        ran
    }

    #[test]
    fn test_miss_returns_placeholder_and_enqueues() {
        let f = fixture();

        let cell = f.cache.get_volatile(63, CacheHints::volatile(1));
        assert!(!cell.is_valid());
        assert_eq!(cell.min(), &[96, 96, 96]);
        assert_eq!(cell.dimensions(), &[4, 4, 4]);
        assert_eq!(cell.data()[0], 0);

        assert!(f.cache.is_pending(63));
        assert_eq!(f.queue.pending_jobs(), 1);
        assert_eq!(f.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_repeated_misses_enqueue_once() {
        let f = fixture();

        for _ in 0..10 {
            f.cache.get_volatile(0, CacheHints::volatile(0));
        }
        assert_eq!(f.queue.pending_jobs(), 1);

        assert_eq!(drain(&f.queue), 1);
        assert_eq!(f.loads.load(Ordering::SeqCst), 1);
        assert!(!f.cache.is_pending(0));
    }

    #[test]
    fn test_valid_after_background_load() {
        let f = fixture();

        assert!(!f.cache.get_volatile(5, CacheHints::default()).is_valid());
        drain(&f.queue);

        let cell = f.cache.get_volatile(5, CacheHints::default());
        assert!(cell.is_valid());
        assert_eq!(cell.data()[0], 1);
        assert_eq!(f.queue.pending_jobs(), 0);
    }

    #[test]
    fn test_blocking_strategy_loads_inline() {
        let f = fixture();

        let cell = f.cache.get_volatile(3, CacheHints::blocking());
        assert!(cell.is_valid());
        assert_eq!(f.loads.load(Ordering::SeqCst), 1);
        assert_eq!(f.queue.pending_jobs(), 0);
    }

    #[test]
    fn test_dont_load_strategy() {
        let f = fixture();

        let cell = f.cache.get_volatile(3, CacheHints::dont_load());
        assert!(!cell.is_valid());
        assert_eq!(f.queue.pending_jobs(), 0);
        assert!(!f.cache.is_pending(3));

        // A cached cell is still returned
        f.cache.get(3).unwrap();
        assert!(f.cache.get_volatile(3, CacheHints::dont_load()).is_valid());
    }

    #[test]
    fn test_placeholder_shared_while_alive() {
        let f = fixture();

        let first = f.cache.get_volatile(9, CacheHints::dont_load());
        let second = f.cache.get_volatile(9, CacheHints::dont_load());
        assert!(Arc::ptr_eq(first.cell(), second.cell()));
    }

    #[test]
    fn test_queue_priority_is_honored() {
        let f = fixture();

        f.cache.get_volatile(1, CacheHints::volatile(3));
        f.cache.get_volatile(2, CacheHints::new(LoadingStrategy::Volatile, 0, true));

        let job = f.queue.next_job().unwrap();
        assert_eq!(job.priority, 0);
        job.run();
        assert!(f.cache.store().contains(2));
        assert!(!f.cache.store().contains(1));
    }

    #[test]
    fn test_closed_queue_keeps_serving_placeholders() {
        let f = fixture();
        f.queue.close();

        let cell = f.cache.get_volatile(4, CacheHints::default());
        assert!(!cell.is_valid());
        assert!(!f.cache.is_pending(4));
    }

    #[test]
    fn test_invalidate_all() {
        let f = fixture();
        f.cache.get(0).unwrap();
        f.cache.get(1).unwrap();

        f.cache.invalidate_all();
        assert!(f.cache.store().is_empty());
        assert!(!f.cache.get_volatile(0, CacheHints::dont_load()).is_valid());
    }

    #[test]
    #[should_panic(expected = "outside grid")]
    fn test_out_of_range_index_panics() {
        let f = fixture();
        f.cache.get_volatile(64, CacheHints::default());
    }
}
