//! Memory budget tracking for bounded memory usage
//!
//! A single [`MemoryBudget`] is shared by every cell store registered with
//! one eviction controller. Stores record their insertions and removals
//! here, so the controller can read the global usage without walking the
//! stores.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory pressure level indicating cache health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% utilization)
    Low,
    /// Memory usage is moderate (50-75% utilization)
    Moderate,
    /// Memory usage is high (75-100% utilization)
    High,
    /// Memory usage exceeds the budget
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization <= 1.0 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Returns true if the next eviction pass has work to do
    pub fn needs_eviction(&self) -> bool {
        matches!(self, MemoryPressure::Critical)
    }
}

/// Memory budget tracker
///
/// # Example
///
/// ```
/// use volcache_cache::MemoryBudget;
///
/// let budget = MemoryBudget::new(1024);
/// budget.record_allocation(1000);
/// assert!(!budget.is_over_budget());
///
/// budget.record_allocation(100);
/// assert_eq!(budget.bytes_over_budget(), 76);
/// assert!(budget.pressure().needs_eviction());
/// ```
#[derive(Debug)]
pub struct MemoryBudget {
    max_size: AtomicUsize,
    current_usage: AtomicUsize,
}

impl MemoryBudget {
    /// Create a budget with a limit of `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: AtomicUsize::new(max_size),
            current_usage: AtomicUsize::new(0),
        }
    }

    /// Create a budget that never asks for eviction
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Get the current memory usage in bytes
    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Acquire)
    }

    /// Get the limit in bytes
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    /// Replace the limit, returning the previous one
    pub fn set_max_size(&self, bytes: usize) -> usize {
        self.max_size.swap(bytes, Ordering::AcqRel)
    }

    /// Get the available memory in bytes
    pub fn available(&self) -> usize {
        self.max_size().saturating_sub(self.current_usage())
    }

    /// Get the current utilization ratio
    ///
    /// Values above 1.0 mean the budget is exceeded.
    pub fn utilization(&self) -> f64 {
        let max_size = self.max_size();
        if max_size == 0 {
            0.0
        } else {
            self.current_usage() as f64 / max_size as f64
        }
    }

    /// Get the current memory pressure level
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    /// Bytes that must be freed to get back within the limit
    pub fn bytes_over_budget(&self) -> usize {
        self.current_usage().saturating_sub(self.max_size())
    }

    pub fn is_over_budget(&self) -> bool {
        self.current_usage() > self.max_size()
    }

    /// Record a memory allocation
    pub fn record_allocation(&self, bytes: usize) {
        self.current_usage.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Record a memory deallocation
    pub fn record_deallocation(&self, bytes: usize) {
        self.current_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unbounded()
    }
}
