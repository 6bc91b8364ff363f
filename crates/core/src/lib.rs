//! Volcache Core Library
//!
//! Opens multiscale label datasets on top of the volcache cell caches.
//!
//! - [`DatasetReader`]: hierarchical block store access, with an in-memory
//!   implementation and an N5 filesystem implementation
//! - [`load_multiscale`]: turns the `s<N>` datasets of a group into
//!   [`PyramidLevel`]s sharing one [`CacheRuntime`]
//! - [`AffineTransform3D`]: level voxel coordinates to physical space
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use volcache_cache::CacheConfig;
//! use volcache_core::{load_multiscale, CacheRuntime, DatasetAttributes, InMemoryReader};
//!
//! let reader = InMemoryReader::new();
//! reader.create_dataset(
//!     "seg/s0",
//!     &DatasetAttributes::label_multiset(vec![64, 64, 16], vec![32, 32, 16]),
//! );
//!
//! let runtime = CacheRuntime::start(CacheConfig::default().with_max_cache_mb(16)).unwrap();
//! let pyramid =
//!     load_multiscale(&runtime, Arc::new(reader), "seg", &[4.0, 4.0, 40.0], &[0.0; 3], 0).unwrap();
//!
//! let level = &pyramid.levels()[0];
//! assert_eq!(level.grid.num_cells(), 4);
//!
//! // Unwritten blocks load as background
//! let cell = level.get(0).unwrap();
//! assert!(cell.data().is_valid());
//! ```

pub mod error;
pub mod loader;
pub mod n5;
pub mod pyramid;
pub mod reader;
pub mod runtime;
pub mod scales;
pub mod transform;

pub use error::{PyramidError, PyramidResult, ReaderError, ReaderResult, RuntimeError};
pub use loader::N5CellLoader;
pub use n5::{decode_block, encode_block, BlockHeader, N5FsReader, N5FsWriter};
pub use pyramid::{load_multiscale, MultiscalePyramid, PyramidLevel};
pub use reader::{join_path, Attributes, Compression, DatasetAttributes, DatasetReader, InMemoryReader};
pub use runtime::CacheRuntime;
pub use scales::{list_and_sort_scale_datasets, scale_level};
pub use transform::AffineTransform3D;
