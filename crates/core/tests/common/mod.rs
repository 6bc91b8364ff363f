#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use volcache_cache::{CacheConfig, CellGrid, LabelMultisetArray};
use volcache_core::{
    encode_block, BlockHeader, CacheRuntime, DatasetAttributes, InMemoryReader,
};

/// Runtime whose timer never fires during a test
pub fn runtime(max_cache_mb: usize) -> CacheRuntime {
    CacheRuntime::start(
        CacheConfig::default()
            .with_max_cache_mb(max_cache_mb)
            .with_fetcher_threads(2)
            .with_eviction_interval(Duration::from_secs(600)),
    )
    .expect("runtime should start")
}

/// Label of every voxel of the cell at `index` in the fixtures below
pub fn label_of(index: u64) -> u64 {
    index + 1
}

/// Block bytes for one cell filled with `label`
pub fn constant_block(grid: &CellGrid, index: u64, label: u64) -> Vec<u8> {
    let interval = grid.cell_interval_of(index).expect("index inside grid");
    let labels = vec![label; interval.num_elements()];
    let payload = LabelMultisetArray::from_labels(&labels).encode();
    encode_block(
        &BlockHeader::varlength(interval.dimensions.clone(), labels.len() as u32),
        &payload,
    )
}

/// Add dataset `dataset` and write every cell as `label_of(index)`
pub fn add_dataset(
    reader: &InMemoryReader,
    dataset: &str,
    dimensions: [u64; 3],
    block_size: [u32; 3],
    factors: Option<[f64; 3]>,
) -> CellGrid {
    reader.create_dataset(
        dataset,
        &DatasetAttributes::label_multiset(dimensions.to_vec(), block_size.to_vec()),
    );
    if let Some(factors) = factors {
        reader
            .set_attribute(dataset, "downsamplingFactors", factors)
            .expect("factors serialize");
    }

    let grid = CellGrid::new(dimensions.to_vec(), block_size.to_vec());
    for index in 0..grid.num_cells() {
        let position = grid.cell_grid_position(index).expect("index inside grid");
        reader.write_block(dataset, &position, constant_block(&grid, index, label_of(index)));
    }
    grid
}

/// Three-level pyramid `seg/s0..s2` over a 100³ volume with 32³ blocks
pub fn three_level_reader() -> Arc<InMemoryReader> {
    let reader = InMemoryReader::new();
    add_dataset(&reader, "seg/s0", [100, 100, 100], [32, 32, 32], None);
    add_dataset(&reader, "seg/s1", [50, 50, 50], [32, 32, 32], Some([2.0, 2.0, 2.0]));
    add_dataset(&reader, "seg/s2", [25, 25, 25], [32, 32, 32], Some([4.0, 4.0, 4.0]));
    Arc::new(reader)
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
