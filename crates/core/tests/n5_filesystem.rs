mod common;

use common::{constant_block, runtime, wait_for};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::sync::Arc;
use volcache_cache::label::BACKGROUND;
use volcache_cache::CellGrid;
use volcache_core::{
    list_and_sort_scale_datasets, load_multiscale, Compression, DatasetAttributes, N5FsReader,
    N5FsWriter, PyramidError, ReaderError,
};

fn write_level(
    writer: &N5FsWriter,
    dataset: &str,
    dimensions: [u64; 3],
    factors: Option<[f64; 3]>,
    skip: &[u64],
) -> CellGrid {
    let block_size = vec![16, 16, 8];
    writer
        .create_dataset(
            dataset,
            &DatasetAttributes::label_multiset(dimensions.to_vec(), block_size.clone()),
        )
        .unwrap();
    if let Some(factors) = factors {
        writer.set_attribute(dataset, "downsamplingFactors", factors).unwrap();
    }

    let grid = CellGrid::new(dimensions.to_vec(), block_size);
    for index in 0..grid.num_cells() {
        if skip.contains(&index) {
            continue;
        }
        let position = grid.cell_grid_position(index).unwrap();
        writer
            .write_block(dataset, &position, &constant_block(&grid, index, 1000 + index))
            .unwrap();
    }
    grid
}

#[test]
fn pyramid_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let writer = N5FsWriter::create(dir.path()).unwrap();
    let grid = write_level(&writer, "volumes/seg/s0", [40, 40, 16], None, &[4]);
    write_level(&writer, "volumes/seg/s1", [20, 20, 16], Some([2.0, 2.0, 1.0]), &[]);
    write_level(&writer, "volumes/seg/s10", [10, 10, 16], Some([4.0, 4.0, 1.0]), &[]);

    let reader = N5FsReader::open(dir.path()).unwrap();
    assert_eq!(
        list_and_sort_scale_datasets(&reader, "volumes/seg").unwrap(),
        vec!["s0", "s1", "s10"]
    );

    let runtime = runtime(32);
    let pyramid = load_multiscale(
        &runtime,
        Arc::new(reader),
        "volumes/seg",
        &[4.0, 4.0, 40.0],
        &[100.0, 0.0, 0.0],
        0,
    )
    .unwrap();
    assert_eq!(pyramid.num_levels(), 3);
    assert_eq!(pyramid.levels()[2].scale_dataset, "volumes/seg/s10");
    assert_eq!(pyramid.levels()[0].transform.translation_part(), [100.0, 0.0, 0.0]);

    let level = &pyramid.levels()[0];
    let mut order: Vec<u64> = (0..grid.num_cells()).collect();
    order.shuffle(&mut thread_rng());
    for &index in &order {
        let cell = level.get(index).unwrap();
        let expected = if index == 4 { BACKGROUND } else { 1000 + index };
        assert_eq!(cell.data().arg_max(0), expected, "cell {}", index);
        assert_eq!(cell.interval(), &grid.cell_interval_of(index).unwrap());
    }

    let coarse = &pyramid.levels()[1];
    assert!(!coarse.get_volatile(0).is_valid());
    assert!(wait_for(|| coarse.get_volatile(0).is_valid()));
    assert_eq!(coarse.get_volatile(0).data().arg_max(0), 1000);
}

#[test]
fn compressed_levels_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let writer = N5FsWriter::create(dir.path()).unwrap();
    let mut attributes = DatasetAttributes::label_multiset(vec![8, 8, 8], vec![8, 8, 8]);
    writer.create_dataset("seg/s0", &attributes).unwrap();
    attributes.compression = Compression {
        kind: "gzip".to_string(),
    };
    writer.create_dataset("seg/s1", &attributes).unwrap();
    writer.set_attribute("seg/s1", "downsamplingFactors", [2.0, 2.0, 2.0]).unwrap();

    let runtime = runtime(8);
    let reader = Arc::new(writer.reader());
    let err = load_multiscale(&runtime, reader, "seg", &[1.0; 3], &[0.0; 3], 0).unwrap_err();

    assert!(matches!(
        err,
        PyramidError::Reader(ReaderError::UnsupportedCompression { .. })
    ));
    assert_eq!(runtime.controller().num_stores(), 0);
}

#[test]
fn malformed_attributes_abort_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let writer = N5FsWriter::create(dir.path()).unwrap();
    writer
        .create_dataset(
            "seg/s0",
            &DatasetAttributes::label_multiset(vec![8, 8, 8], vec![8, 8, 8]),
        )
        .unwrap();
    std::fs::create_dir_all(dir.path().join("seg/s1")).unwrap();
    std::fs::write(dir.path().join("seg/s1/attributes.json"), "{ not json").unwrap();

    let runtime = runtime(8);
    let reader = Arc::new(writer.reader());
    let err = load_multiscale(&runtime, reader, "seg", &[1.0; 3], &[0.0; 3], 0).unwrap_err();
    assert!(matches!(err, PyramidError::Reader(ReaderError::Json { .. })));
}
