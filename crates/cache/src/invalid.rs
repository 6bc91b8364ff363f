//! Placeholder cells for data that is not loaded yet

use crate::cell::Cell;
use crate::grid::{CellGrid, CellIndex};
use crate::label::LabelMultisetArray;
use std::sync::Arc;

/// Synthesizes a placeholder cell for an index
///
/// Placeholders must have the same interval as the real cell, so that a
/// renderer can draw them in place of the data.
pub trait CreateInvalid<A>: Send + Sync {
    fn create_invalid(&self, index: CellIndex) -> Cell<A>;
}

impl<A, F> CreateInvalid<A> for F
where
    F: Fn(CellIndex) -> Cell<A> + Send + Sync,
{
    fn create_invalid(&self, index: CellIndex) -> Cell<A> {
        self(index)
    }
}

/// Placeholder synthesizer for label multiset cells
///
/// Every voxel holds the multiset `{INVALID x 1}`.
#[derive(Debug, Clone)]
pub struct InvalidLabelMultisetCell {
    grid: Arc<CellGrid>,
}

impl InvalidLabelMultisetCell {
    pub fn new(grid: Arc<CellGrid>) -> Self {
        Self { grid }
    }
}

impl CreateInvalid<LabelMultisetArray> for InvalidLabelMultisetCell {
    /// # Panics
    ///
    /// Panics if `index` is outside the grid.
    fn create_invalid(&self, index: CellIndex) -> Cell<LabelMultisetArray> {
        let interval = self.grid.cell_interval_of(index).unwrap_or_else(|| {
            panic!(
                "cell index {} outside grid with {} cells",
                index,
                self.grid.num_cells()
            )
        });
        let data = LabelMultisetArray::invalid(interval.num_elements());
        Cell::new(interval, data)
    }
}
