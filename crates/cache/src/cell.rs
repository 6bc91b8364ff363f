//! Cells and their volatile views

use crate::grid::CellInterval;
use std::mem;
use std::ops::Deref;
use std::sync::Arc;

/// Payload stored in a cell
pub trait CellData: Send + Sync + 'static {
    /// Approximate heap footprint in bytes, used for cache accounting
    fn memory_size(&self) -> usize;
}

impl<T: Copy + Send + Sync + 'static> CellData for Vec<T> {
    fn memory_size(&self) -> usize {
        self.len() * mem::size_of::<T>()
    }
}

/// One block of an image: its interval plus payload
#[derive(Debug)]
pub struct Cell<A> {
    interval: CellInterval,
    data: A,
}

impl<A> Cell<A> {
    pub fn new(interval: CellInterval, data: A) -> Self {
        Self { interval, data }
    }

    pub fn interval(&self) -> &CellInterval {
        &self.interval
    }

    pub fn grid_position(&self) -> &[u64] {
        &self.interval.grid_position
    }

    pub fn min(&self) -> &[u64] {
        &self.interval.min
    }

    pub fn dimensions(&self) -> &[u32] {
        &self.interval.dimensions
    }

    pub fn num_elements(&self) -> usize {
        self.interval.num_elements()
    }

    pub fn data(&self) -> &A {
        &self.data
    }
}

impl<A: CellData> Cell<A> {
    /// Bytes charged against the cache budget for this cell
    pub fn memory_size(&self) -> usize {
        let interval = self.interval.grid_position.len() * 8
            + self.interval.min.len() * 8
            + self.interval.dimensions.len() * 4;
        mem::size_of::<Self>() + interval + self.data.memory_size()
    }
}

/// A cell as seen by a renderer: either real data or a placeholder
///
/// Dereferences to the underlying [`Cell`].
#[derive(Debug)]
pub struct VolatileCell<A> {
    cell: Arc<Cell<A>>,
    valid: bool,
}

impl<A> VolatileCell<A> {
    pub fn valid(cell: Arc<Cell<A>>) -> Self {
        Self { cell, valid: true }
    }

    pub fn invalid(cell: Arc<Cell<A>>) -> Self {
        Self { cell, valid: false }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn cell(&self) -> &Arc<Cell<A>> {
        &self.cell
    }

    pub fn into_cell(self) -> Arc<Cell<A>> {
        self.cell
    }
}

impl<A> Clone for VolatileCell<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            valid: self.valid,
        }
    }
}

impl<A> Deref for VolatileCell<A> {
    type Target = Cell<A>;

    fn deref(&self) -> &Cell<A> {
        &self.cell
    }
}
