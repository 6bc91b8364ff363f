//! Block loader for label multiset datasets

use crate::error::{ReaderError, ReaderResult};
use crate::n5::decode_block;
use crate::reader::{DatasetAttributes, DatasetReader};
use std::sync::Arc;
use tracing::trace;
use volcache_cache::{CellIndex, CellInterval, CellLoader, LabelMultisetArray, LoadError};

/// Loads label multiset cells from one dataset of a [`DatasetReader`]
///
/// Unwritten blocks load as all-background cells.
#[derive(Clone)]
pub struct N5CellLoader {
    reader: Arc<dyn DatasetReader>,
    dataset: String,
}

impl N5CellLoader {
    /// Create a loader for `dataset`, rejecting compressed datasets
    pub fn new(reader: Arc<dyn DatasetReader>, dataset: &str) -> ReaderResult<Self> {
        let attributes = reader.dataset_attributes(dataset)?;
        Self::with_attributes(reader, dataset, &attributes)
    }

    pub(crate) fn with_attributes(
        reader: Arc<dyn DatasetReader>,
        dataset: &str,
        attributes: &DatasetAttributes,
    ) -> ReaderResult<Self> {
        if !attributes.compression.is_raw() {
            return Err(ReaderError::UnsupportedCompression {
                dataset: dataset.to_string(),
                compression: attributes.compression.kind.clone(),
            });
        }
        Ok(Self {
            reader,
            dataset: dataset.to_string(),
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

impl CellLoader<LabelMultisetArray> for N5CellLoader {
    fn load(&self, index: CellIndex, interval: &CellInterval) -> Result<LabelMultisetArray, LoadError> {
        let num_elements = interval.num_elements();
        let bytes = match self.reader.read_block(&self.dataset, &interval.grid_position)? {
            Some(bytes) => bytes,
            None => {
                trace!(dataset = %self.dataset, index, "block absent, using background");
                return Ok(LabelMultisetArray::background(num_elements));
            }
        };

        let (header, payload) = decode_block(&bytes)?;
        if header.num_elements.is_some() && header.element_count() != num_elements {
            return Err(LoadError::Decode(format!(
                "block {:?} of {} holds {} elements, cell has {}",
                interval.grid_position,
                self.dataset,
                header.element_count(),
                num_elements
            )));
        }

        let data = LabelMultisetArray::decode(payload, num_elements)?;
        trace!(dataset = %self.dataset, index, lists = data.num_lists(), "decoded block");
        Ok(data)
    }
}
