//! Volcache Cache Library
//!
//! Memory-bounded caches of image cells (blocks of an n-dimensional image).
//!
//! - [`CellStore`]: blocking loader cache with one load per index at a time
//! - [`VolatileCache`]: non-blocking view that answers misses with
//!   placeholders and loads in the background
//! - [`EvictionController`]: one memory budget shared by many stores, with
//!   least recently used eviction across all of them
//!
//! The crate logs through `tracing` and never installs a subscriber.

pub mod cell;
pub mod config;
pub mod error;
pub mod eviction;
pub mod grid;
pub mod invalid;
pub mod label;
pub mod memory_budget;
pub mod store;
pub mod volatile;

pub use cell::{Cell, CellData, VolatileCell};
pub use config::{CacheConfig, ConfigError};
pub use error::{CacheError, CacheResult, LoadError};
pub use eviction::{
    CacheEvent, CacheStats, Evictable, EvictionCandidate, EvictionController, EvictionReport,
    StoreId, SubscriptionId,
};
pub use grid::{CellGrid, CellIndex, CellInterval};
pub use invalid::{CreateInvalid, InvalidLabelMultisetCell};
pub use label::{LabelMultisetArray, LabelMultisetEntry};
pub use memory_budget::{MemoryBudget, MemoryPressure};
pub use store::{AccessClock, CellLoader, CellStore, StoreStats};
pub use volatile::{CacheHints, LoadingStrategy, VolatileCache};
