//! Cell grid geometry
//!
//! A grid partitions an n-dimensional image into blocks of a fixed nominal
//! shape. Blocks on the upper border are truncated to the image bounds.
//! Flat cell indices enumerate grid positions with dimension 0 fastest.

/// Flat address of a cell within one grid
pub type CellIndex = u64;

/// Position and extent of one cell
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellInterval {
    /// Position of the cell in the grid (in cells)
    pub grid_position: Vec<u64>,

    /// Minimum voxel coordinate of the cell
    pub min: Vec<u64>,

    /// Voxel extent of the cell, truncated at the image border
    pub dimensions: Vec<u32>,
}

impl CellInterval {
    /// Number of voxels in the cell
    pub fn num_elements(&self) -> usize {
        self.dimensions.iter().map(|&d| d as usize).product()
    }

    /// Maximum voxel coordinate (inclusive)
    pub fn max(&self) -> Vec<u64> {
        self.min
            .iter()
            .zip(&self.dimensions)
            .map(|(&min, &dim)| min + dim as u64 - 1)
            .collect()
    }
}

/// Grid of cells over an image
///
/// # Example
///
/// ```
/// use volcache_cache::CellGrid;
///
/// let grid = CellGrid::new(vec![100, 100, 100], vec![32, 32, 32]);
/// assert_eq!(grid.grid_dimensions(), &[4, 4, 4]);
///
/// // The last cell along every axis is truncated to 4 voxels
/// let interval = grid.cell_interval_of(63).unwrap();
/// assert_eq!(interval.min, vec![96, 96, 96]);
/// assert_eq!(interval.dimensions, vec![4, 4, 4]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellGrid {
    dimensions: Vec<u64>,
    cell_dimensions: Vec<u32>,
    grid_dimensions: Vec<u64>,
    num_cells: u64,
}

impl CellGrid {
    /// Create a grid over an image of `dimensions` with nominal cell shape
    /// `cell_dimensions`
    ///
    /// # Panics
    ///
    /// Panics if the two shapes differ in length or a cell dimension is zero.
    pub fn new(dimensions: Vec<u64>, cell_dimensions: Vec<u32>) -> Self {
        assert_eq!(
            dimensions.len(),
            cell_dimensions.len(),
            "image and cell shapes must have the same dimensionality"
        );
        assert!(
            cell_dimensions.iter().all(|&d| d > 0),
            "cell dimensions must be positive: {:?}",
            cell_dimensions
        );

        let grid_dimensions: Vec<u64> = dimensions
            .iter()
            .zip(&cell_dimensions)
            .map(|(&dim, &cell)| dim.div_ceil(cell as u64))
            .collect();
        let num_cells = grid_dimensions.iter().product();

        Self {
            dimensions,
            cell_dimensions,
            grid_dimensions,
            num_cells,
        }
    }

    /// Number of dimensions
    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }

    /// Image dimensions in voxels
    pub fn dimensions(&self) -> &[u64] {
        &self.dimensions
    }

    /// Nominal cell shape in voxels
    pub fn cell_dimensions(&self) -> &[u32] {
        &self.cell_dimensions
    }

    /// Grid dimensions in cells
    pub fn grid_dimensions(&self) -> &[u64] {
        &self.grid_dimensions
    }

    /// Total number of cells
    pub fn num_cells(&self) -> u64 {
        self.num_cells
    }

    /// Check whether `index` addresses a cell of this grid
    pub fn contains_index(&self, index: CellIndex) -> bool {
        index < self.num_cells
    }

    /// Grid position of a flat cell index, or `None` if out of range
    pub fn cell_grid_position(&self, index: CellIndex) -> Option<Vec<u64>> {
        if !self.contains_index(index) {
            return None;
        }

        let mut remainder = index;
        let position = self
            .grid_dimensions
            .iter()
            .map(|&dim| {
                let coordinate = remainder % dim;
                remainder /= dim;
                coordinate
            })
            .collect();
        Some(position)
    }

    /// Flat index of a grid position, or `None` if out of range
    pub fn index_of(&self, grid_position: &[u64]) -> Option<CellIndex> {
        if grid_position.len() != self.num_dimensions() {
            return None;
        }

        let mut index = 0;
        let mut stride = 1;
        for (&coordinate, &dim) in grid_position.iter().zip(&self.grid_dimensions) {
            if coordinate >= dim {
                return None;
            }
            index += coordinate * stride;
            stride *= dim;
        }
        Some(index)
    }

    /// Voxel interval of the cell at `grid_position`
    ///
    /// # Panics
    ///
    /// Panics if the position lies outside the grid.
    pub fn cell_interval(&self, grid_position: &[u64]) -> CellInterval {
        assert!(
            self.index_of(grid_position).is_some(),
            "grid position {:?} outside grid {:?}",
            grid_position,
            self.grid_dimensions
        );

        let mut min = Vec::with_capacity(grid_position.len());
        let mut dimensions = Vec::with_capacity(grid_position.len());
        for d in 0..grid_position.len() {
            let cell = self.cell_dimensions[d] as u64;
            let start = grid_position[d] * cell;
            min.push(start);
            dimensions.push(cell.min(self.dimensions[d] - start) as u32);
        }

        CellInterval {
            grid_position: grid_position.to_vec(),
            min,
            dimensions,
        }
    }

    /// Voxel interval of the cell with flat index `index`, or `None` if out
    /// of range
    pub fn cell_interval_of(&self, index: CellIndex) -> Option<CellInterval> {
        self.cell_grid_position(index)
            .map(|position| self.cell_interval(&position))
    }
}
