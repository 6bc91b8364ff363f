mod common;

use common::{add_dataset, constant_block, label_of, runtime, three_level_reader, wait_for};
use std::sync::Arc;
use std::thread;
use volcache_cache::label::INVALID;
use volcache_cache::{CacheError, CacheHints, CellGrid, LabelMultisetEntry};
use volcache_core::{load_multiscale, DatasetAttributes, InMemoryReader, MultiscalePyramid};

const RESOLUTION: [f64; 3] = [4.0, 4.0, 40.0];

fn open(runtime: &volcache_core::CacheRuntime, reader: &Arc<InMemoryReader>) -> MultiscalePyramid {
    load_multiscale(runtime, reader.clone(), "seg", &RESOLUTION, &[0.0; 3], 0)
        .expect("pyramid should load")
}

#[test]
fn concurrent_requests_share_one_load() {
    let runtime = runtime(64);
    let reader = three_level_reader();
    let pyramid = Arc::new(open(&runtime, &reader));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pyramid = pyramid.clone();
            thread::spawn(move || {
                let level = &pyramid.levels()[0];
                for _ in 0..50 {
                    let _ = level.get_volatile(5);
                }
                if i % 2 == 0 {
                    level.get(5).expect("blocking get should succeed");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let level = &pyramid.levels()[0];
    assert!(wait_for(|| level.get_volatile(5).is_valid()));
    assert!(wait_for(|| level.volatile.pending_loads() == 0));
    assert_eq!(reader.block_reads(), 1);
    assert_eq!(level.store.stats().loads, 1);
}

#[test]
fn placeholder_matches_truncated_border_cell() {
    let runtime = runtime(64);
    let reader = three_level_reader();
    let pyramid = open(&runtime, &reader);
    let level = &pyramid.levels()[0];

    assert_eq!(level.grid.num_cells(), 64);
    let placeholder = level.get_volatile_with(63, CacheHints::dont_load());

    assert!(!placeholder.is_valid());
    assert_eq!(placeholder.min(), &[96, 96, 96]);
    assert_eq!(placeholder.dimensions(), &[4, 4, 4]);
    assert_eq!(placeholder.num_elements(), 64);
    assert!(!placeholder.data().is_valid());
    for voxel in 0..64 {
        assert_eq!(placeholder.data().entries(voxel), &[LabelMultisetEntry::new(INVALID, 1)]);
    }
    assert_eq!(reader.block_reads(), 0);
}

#[test]
fn background_load_becomes_visible() {
    let runtime = runtime(64);
    let reader = three_level_reader();
    let pyramid = open(&runtime, &reader);
    let level = &pyramid.levels()[1];

    let first = level.get_volatile(3);
    assert!(!first.is_valid());

    assert!(wait_for(|| level.get_volatile(3).is_valid()));
    for _ in 0..10 {
        let cell = level.get_volatile(3);
        assert!(cell.is_valid());
        assert_eq!(cell.data().arg_max(0), label_of(3));
    }
}

#[test]
fn blocking_hint_loads_on_caller() {
    let runtime = runtime(64);
    let reader = three_level_reader();
    let pyramid = open(&runtime, &reader);
    let level = &pyramid.levels()[2];

    let cell = level.get_volatile_with(0, CacheHints::blocking());
    assert!(cell.is_valid());
    assert_eq!(cell.dimensions(), &[25, 25, 25]);
    assert_eq!(cell.data().arg_max(100), label_of(0));
    assert!(level.store.contains(0));
}

#[test]
fn eviction_brings_usage_under_budget() {
    let runtime = runtime(2);
    let reader = three_level_reader();
    let pyramid = open(&runtime, &reader);
    let level = &pyramid.levels()[0];
    let controller = runtime.controller();

    for index in 0..level.grid.num_cells() {
        level.get(index).expect("cell should load");
    }
    assert!(controller.current_memory_usage_in_bytes() > controller.max_size());

    let report = controller.restrict_to_max_size();
    assert!(report.evicted > 0);
    assert!(report.is_within_budget());
    assert!(controller.current_memory_usage_in_bytes() <= controller.max_size());
    assert_eq!(pyramid.memory_used(), controller.current_memory_usage_in_bytes());

    // Evicted cells load again on the next request
    let reads = reader.block_reads();
    for index in 0..level.grid.num_cells() {
        let cell = level.get(index).expect("cell should reload");
        assert_eq!(cell.data().arg_max(0), label_of(index));
    }
    assert!(reader.block_reads() > reads);
}

#[test]
fn shrinking_the_limit_evicts_at_once() {
    let runtime = runtime(64);
    let reader = three_level_reader();
    let pyramid = open(&runtime, &reader);
    let controller = runtime.controller();

    for level in pyramid.levels() {
        for index in 0..level.grid.num_cells() {
            level.get(index).expect("cell should load");
        }
    }

    let report = controller.set_max_size(1024 * 1024).unwrap();
    assert!(report.evicted > 0);
    assert!(controller.current_memory_usage_in_bytes() <= 1024 * 1024);
    assert!(matches!(
        controller.set_max_size(0),
        Err(CacheError::InvalidMaxSize(0))
    ));
}

#[test]
fn transforms_agree_across_levels() {
    let runtime = runtime(64);
    let reader = three_level_reader();
    let pyramid = open(&runtime, &reader);
    let transforms = pyramid.transforms();
    let factors: Vec<[f64; 3]> = pyramid
        .levels()
        .iter()
        .map(|level| level.downsampling_factors)
        .collect();
    assert_eq!(factors, vec![[1.0; 3], [2.0; 3], [4.0; 3]]);

    for point in [[0.0, 0.0, 0.0], [123.0, 57.5, 880.0], [399.0, 12.0, 3999.0]] {
        let finest = transforms[0].apply_inverse(point).unwrap();
        for (transform, factor) in transforms.iter().zip(&factors).skip(1) {
            let coarse = transform.apply_inverse(point).unwrap();
            for d in 0..3 {
                let expected = finest[d] / factor[d];
                assert!(
                    (coarse[d] - expected).abs() < 1.0,
                    "level with factors {:?} misplaces {:?} on axis {}",
                    factor,
                    point,
                    d
                );
            }
        }
    }

    // Level voxel centers land in the matching finest voxel
    let center = transforms[2].apply([1.0, 1.0, 1.0]);
    let finest = transforms[0].apply_inverse(center).unwrap();
    for d in 0..3 {
        assert!(finest[d] >= 4.0 && finest[d] < 8.0);
    }
}

#[test]
fn anisotropic_factors_shift_only_downsampled_axes() {
    let runtime = runtime(64);
    let reader = InMemoryReader::new();
    let attrs = DatasetAttributes::label_multiset(vec![64, 64, 16], vec![32, 32, 16]);
    reader.create_dataset("seg/s0", &attrs);
    reader.create_dataset("seg/s1", &attrs);
    reader.create_dataset("seg/s2", &attrs);
    reader.set_attribute("seg/s1", "downsamplingFactors", [2.0, 2.0, 1.0]).unwrap();
    reader.set_attribute("seg/s2", "downsamplingFactors", [4.0, 4.0, 1.0]).unwrap();
    let reader = Arc::new(reader);

    let pyramid = open(&runtime, &reader);
    let level = &pyramid.levels()[1];

    assert_eq!(level.resolution, [8.0, 8.0, 40.0]);
    assert!(level.shift[0] != 0.0);
    assert!(level.shift[1] != 0.0);
    assert_eq!(level.shift[2], 0.0);
    assert_eq!(level.shift, [0.25, 0.25, 0.0]);
    assert_eq!(pyramid.levels()[2].shift, [0.375, 0.375, 0.0]);
}

#[test]
fn load_failures_are_not_cached() {
    let runtime = runtime(64);
    let reader = InMemoryReader::new();
    let grid: CellGrid = add_dataset(&reader, "seg/s0", [64, 64, 32], [32, 32, 32], None);
    reader.write_block("seg/s0", &[0, 0, 0], vec![0, 1, 0]);
    let reader = Arc::new(reader);

    let pyramid = open(&runtime, &reader);
    let level = &pyramid.levels()[0];

    let err = level.get(0).unwrap_err();
    assert!(matches!(err, CacheError::LoadFailed { index: 0, .. }));
    assert!(!level.get_volatile_with(0, CacheHints::blocking()).is_valid());

    // Background failures leave the placeholder in place
    assert!(!level.get_volatile(0).is_valid());
    assert!(wait_for(|| !level.volatile.is_pending(0)));
    assert!(!level.store.contains(0));

    // Siblings are unaffected
    assert_eq!(level.get(1).unwrap().data().arg_max(0), label_of(1));

    // The next access retries
    reader.write_block("seg/s0", &[0, 0, 0], constant_block(&grid, 0, 42));
    assert_eq!(level.get(0).unwrap().data().arg_max(0), 42);
    assert!(runtime.controller().stats().load_failures >= 2);
}

#[test]
fn closing_releases_every_level() {
    let runtime = runtime(64);
    let reader = three_level_reader();
    let controller = runtime.controller().clone();

    let pyramid = open(&runtime, &reader);
    let other = open(&runtime, &reader);
    assert_eq!(controller.num_stores(), 6);

    for level in pyramid.levels() {
        level.get(0).unwrap();
    }
    other.levels()[0].get(0).unwrap();
    assert!(controller.current_memory_usage_in_bytes() > 0);

    pyramid.close();
    assert_eq!(controller.num_stores(), 3);
    assert_eq!(
        controller.current_memory_usage_in_bytes(),
        other.memory_used()
    );

    drop(other);
    assert_eq!(controller.num_stores(), 0);
    assert_eq!(controller.current_memory_usage_in_bytes(), 0);
}

#[test]
fn store_outliving_its_pyramid_stays_evictable() {
    let runtime = runtime(1);
    let reader = three_level_reader();
    let controller = runtime.controller().clone();

    let pyramid = open(&runtime, &reader);
    let store = pyramid.levels()[0].store.clone();
    let num_cells = pyramid.levels()[0].grid.num_cells();
    pyramid.close();

    assert_eq!(controller.num_stores(), 1);
    assert_eq!(controller.current_memory_usage_in_bytes(), 0);

    for index in 0..num_cells {
        store.get(index).unwrap();
    }
    assert!(controller.current_memory_usage_in_bytes() > controller.max_size());

    let report = controller.restrict_to_max_size();
    assert!(report.evicted > 0);
    assert!(report.is_within_budget());
    assert!(controller.current_memory_usage_in_bytes() <= controller.max_size());

    drop(store);
    assert_eq!(controller.num_stores(), 0);
    assert_eq!(controller.current_memory_usage_in_bytes(), 0);
}
