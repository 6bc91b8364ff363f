//! Multiscale pyramid loader
//!
//! Opens every `s<N>` dataset of a group as one resolution level: a cell
//! store charged against the runtime's shared budget, a volatile view in
//! front of it, and the transform from level voxel coordinates into
//! physical space.
//!
//! Coarser levels sample the same physical extent with fewer voxels. A
//! coarse voxel center does not coincide with a fine voxel center, so each
//! level's transform carries a half-voxel shift of
//! `0.5 / initial[d] - 0.5 / factors[d]` (in level voxels) that lines the
//! levels up.

use crate::error::{PyramidError, PyramidResult, ReaderError};
use crate::loader::N5CellLoader;
use crate::reader::{join_path, DatasetReader};
use crate::runtime::CacheRuntime;
use crate::scales::list_and_sort_scale_datasets;
use crate::transform::AffineTransform3D;
use std::sync::Arc;
use tracing::{debug, info};
use volcache_cache::{
    CacheHints, CacheResult, Cell, CellGrid, CellIndex, CellStore, InvalidLabelMultisetCell, LabelMultisetArray, VolatileCache, VolatileCell,
};
use volcache_scheduler::QueuePriority;

const DOWNSAMPLING_FACTORS_KEY: &str = "downsamplingFactors";

/// One resolution level of an opened pyramid
pub struct PyramidLevel {
    /// Full path of the scale dataset
    pub scale_dataset: String,
    pub grid: Arc<CellGrid>,
    pub downsampling_factors: [f64; 3],
    /// Physical size of one voxel of this level
    pub resolution: [f64; 3],
    /// Half-voxel alignment shift, in level voxels
    pub shift: [f64; 3],
    pub transform: AffineTransform3D,
    pub store: Arc<CellStore<LabelMultisetArray>>,
    pub volatile: VolatileCache<LabelMultisetArray>,
}

impl PyramidLevel {
    /// Blocking get of the real cell
    pub fn get(&self, index: CellIndex) -> CacheResult<Arc<Cell<LabelMultisetArray>>> {
        self.store.get(index)
    }

    /// Non-blocking get with the level's default hints
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the level's grid.
    pub fn get_volatile(&self, index: CellIndex) -> VolatileCell<LabelMultisetArray> {
        self.volatile.get_volatile(index, self.volatile.default_hints())
    }

    /// Non-blocking get with explicit hints
    pub fn get_volatile_with(
        &self,
        index: CellIndex,
        hints: CacheHints,
    ) -> VolatileCell<LabelMultisetArray> {
        self.volatile.get_volatile(index, hints)
    }
}

impl std::fmt::Debug for PyramidLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidLevel")
            .field("scale_dataset", &self.scale_dataset)
            .field("dimensions", &self.grid.dimensions())
            .field("downsampling_factors", &self.downsampling_factors)
            .field("resolution", &self.resolution)
            .field("shift", &self.shift)
            .field("store", &self.store.id())
            .finish()
    }
}

/// Opened pyramid, finest level first
///
/// Dropping the pyramid closes it.
#[derive(Debug)]
pub struct MultiscalePyramid {
    group: String,
    levels: Vec<PyramidLevel>,
}

impl MultiscalePyramid {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn level(&self, level: usize) -> Option<&PyramidLevel> {
        self.levels.get(level)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn transforms(&self) -> Vec<AffineTransform3D> {
        self.levels.iter().map(|level| level.transform).collect()
    }

    /// Bytes held by the cells of all levels
    pub fn memory_used(&self) -> usize {
        self.levels.iter().map(|level| level.store.memory_used()).sum()
    }

    /// Drop every cached cell and placeholder of every level
    pub fn invalidate_all(&self) {
        for level in &self.levels {
            level.volatile.invalidate_all();
        }
    }

    /// Release every level's cells and drop the level stores
    ///
    /// A store leaves the controller once its last handle is gone. Handles
    /// still held elsewhere, such as a queued background load, keep it
    /// registered and evictable until then.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for MultiscalePyramid {
    fn drop(&mut self) {
        self.invalidate_all();
        debug!(group = %self.group, levels = self.levels.len(), "closed pyramid");
    }
}

/// Metadata of one level, validated before any store is created
struct LevelMetadata {
    dataset: String,
    grid: CellGrid,
    factors: [f64; 3],
    loader: N5CellLoader,
}

fn to_vec3(values: &[f64], what: &'static str) -> PyramidResult<[f64; 3]> {
    match values {
        &[x, y, z] => Ok([x, y, z]),
        _ => Err(PyramidError::InvalidVector {
            what,
            found: values.len(),
        }),
    }
}

fn read_factors(
    reader: &dyn DatasetReader,
    dataset: &str,
    is_finest: bool,
) -> PyramidResult<[f64; 3]> {
    let factors: Option<Vec<f64>> = reader.attribute_as(dataset, DOWNSAMPLING_FACTORS_KEY)?;
    let factors = match factors {
        Some(factors) => factors,
        None if is_finest => return Ok([1.0; 3]),
        None => {
            return Err(PyramidError::MissingDownsamplingFactors {
                dataset: dataset.to_string(),
            })
        }
    };

    let invalid = |reason: &'static str| PyramidError::InvalidDownsamplingFactors {
        dataset: dataset.to_string(),
        factors: factors.clone(),
        reason,
    };
    if factors.len() != 3 {
        return Err(invalid("expected 3 components"));
    }
    if factors.iter().any(|f| !f.is_finite() || *f <= 0.0) {
        return Err(invalid("factors must be positive"));
    }
    Ok([factors[0], factors[1], factors[2]])
}

fn read_level(
    reader: &Arc<dyn DatasetReader>,
    dataset: String,
    previous: Option<&[f64; 3]>,
) -> PyramidResult<LevelMetadata> {
    let attributes = reader.dataset_attributes(&dataset)?;
    if attributes.num_dimensions() != 3 {
        return Err(PyramidError::NotThreeDimensional {
            dataset,
            found: attributes.num_dimensions(),
        });
    }
    if attributes.dimensions.contains(&0) {
        return Err(ReaderError::InvalidAttribute {
            path: dataset,
            key: "dimensions".to_string(),
            reason: "dimensions must be positive".to_string(),
        }
        .into());
    }

    let factors = read_factors(reader.as_ref(), &dataset, previous.is_none())?;
    if let Some(previous) = previous {
        if factors.iter().zip(previous).any(|(f, p)| f < p) {
            return Err(PyramidError::InvalidDownsamplingFactors {
                dataset,
                factors: factors.to_vec(),
                reason: "factors decrease from the previous level",
            });
        }
    }

    let loader = N5CellLoader::with_attributes(reader.clone(), &dataset, &attributes)?;
    let grid = CellGrid::new(attributes.dimensions, attributes.block_size);
    Ok(LevelMetadata {
        dataset,
        grid,
        factors,
        loader,
    })
}

/// Open every scale level of `group`
///
/// `resolution` is the physical voxel size of the finest level and `offset`
/// its origin. Background loads of every level use `priority`.
///
/// # Errors
///
/// Fails without creating any store if the group has no scale datasets or
/// any level's metadata is missing or malformed.
pub fn load_multiscale(
    runtime: &CacheRuntime,
    reader: Arc<dyn DatasetReader>,
    group: &str,
    resolution: &[f64],
    offset: &[f64],
    priority: QueuePriority,
) -> PyramidResult<MultiscalePyramid> {
    let resolution = to_vec3(resolution, "resolution")?;
    let offset = to_vec3(offset, "offset")?;

    let scales = list_and_sort_scale_datasets(reader.as_ref(), group)?;
    let mut validated: Vec<LevelMetadata> = Vec::with_capacity(scales.len());
    for scale in &scales {
        let previous = validated.last().map(|meta| &meta.factors);
        let meta = read_level(&reader, join_path(group, scale), previous)?;
        validated.push(meta);
    }

    let controller = runtime.controller();
    let hints = CacheHints::volatile(priority);
    let initial = validated[0].factors;

    // Stores created before a failure are dropped with `levels`; their
    // registrations are pruned by the controller.
    let mut levels = Vec::with_capacity(validated.len());
    for meta in validated {
        let mut scaled_resolution = [0.0; 3];
        let mut shift = [0.0; 3];
        for d in 0..3 {
            scaled_resolution[d] = meta.factors[d] * resolution[d];
            shift[d] = 0.5 / initial[d] - 0.5 / meta.factors[d];
        }
        let transform = AffineTransform3D::from_scale_and_translation(scaled_resolution, offset)
            .concatenate(&AffineTransform3D::translation(shift));

        let grid = Arc::new(meta.grid);
        let store = controller.create_store(grid.clone(), meta.loader)?;
        let volatile = VolatileCache::new(
            store.clone(),
            Arc::new(InvalidLabelMultisetCell::new(grid.clone())),
            runtime.queue().clone(),
            hints,
        );

        debug!(
            dataset = %meta.dataset,
            factors = ?meta.factors,
            resolution = ?scaled_resolution,
            shift = ?shift,
            cells = grid.num_cells(),
            "opened pyramid level"
        );

        levels.push(PyramidLevel {
            scale_dataset: meta.dataset,
            grid,
            downsampling_factors: meta.factors,
            resolution: scaled_resolution,
            shift,
            transform,
            store,
            volatile,
        });
    }

    info!(group, levels = levels.len(), "loaded multiscale pyramid");
    Ok(MultiscalePyramid {
        group: group.to_string(),
        levels,
    })
}
