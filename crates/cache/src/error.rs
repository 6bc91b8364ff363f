//! Error types for cell loading and cache administration

use crate::grid::CellIndex;
use std::io;
use std::sync::Arc;

/// Failure of a single cell load
///
/// Cloneable so that one failure can be handed to every caller waiting on
/// the same in-flight load.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] Arc<io::Error>),

    #[error("block at grid position {0:?} does not exist")]
    MissingBlock(Vec<u64>),

    #[error("failed to decode cell: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        LoadError::Io(Arc::new(err))
    }
}

/// Error types for cache operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("failed to load cell {index}: {source}")]
    LoadFailed {
        index: CellIndex,
        #[source]
        source: LoadError,
    },

    #[error("cell index {index} is outside the grid ({num_cells} cells)")]
    InvalidIndex { index: CellIndex, num_cells: u64 },

    #[error("invalid maximum cache size: {0} bytes")]
    InvalidMaxSize(usize),

    #[error("eviction controller has been shut down")]
    ControllerShutDown,

    #[error("failed to spawn cache thread: {0}")]
    ThreadSpawn(#[source] Arc<io::Error>),
}

pub type CacheResult<T> = Result<T, CacheError>;
