//! Backing dataset reader abstraction
//!
//! A reader exposes an N5-style hierarchy: groups and datasets addressed by
//! slash-separated paths, JSON attributes per path, and raw block bytes per
//! dataset and block grid position. Block bytes include the N5 block header;
//! see [`crate::n5::decode_block`].

use crate::error::{ReaderError, ReaderResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Attributes file content of a group or dataset
pub type Attributes = Map<String, Value>;

/// Compression block of the dataset attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compression {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Compression {
    pub fn raw() -> Self {
        Self {
            kind: "raw".to_string(),
        }
    }

    pub fn is_raw(&self) -> bool {
        self.kind == "raw"
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::raw()
    }
}

/// Shape metadata of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAttributes {
    pub dimensions: Vec<u64>,
    pub block_size: Vec<u32>,
    pub data_type: String,
    #[serde(default)]
    pub compression: Compression,
}

impl DatasetAttributes {
    /// Attributes of an uncompressed label multiset dataset
    pub fn label_multiset(dimensions: Vec<u64>, block_size: Vec<u32>) -> Self {
        Self {
            dimensions,
            block_size,
            data_type: "uint8".to_string(),
            compression: Compression::raw(),
        }
    }

    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }
}

/// Read access to a hierarchical block store
pub trait DatasetReader: Send + Sync {
    /// Check whether a group or dataset exists at `path`
    fn exists(&self, path: &str) -> bool;

    /// Names of the direct children of `path`, sorted lexicographically
    fn list(&self, path: &str) -> ReaderResult<Vec<String>>;

    /// All attributes at `path`; empty if the path has none
    fn attributes(&self, path: &str) -> ReaderResult<Attributes>;

    /// Raw bytes of one block, or `None` if the block was never written
    fn read_block(&self, dataset: &str, grid_position: &[u64]) -> ReaderResult<Option<Vec<u8>>>;

    /// One attribute at `path`
    fn attribute(&self, path: &str, key: &str) -> ReaderResult<Option<Value>> {
        Ok(self.attributes(path)?.remove(key))
    }

    /// Shape metadata of the dataset at `path`
    fn dataset_attributes(&self, path: &str) -> ReaderResult<DatasetAttributes> {
        let attributes = self.attributes(path)?;
        if !attributes.contains_key("dimensions") {
            return Err(ReaderError::NoSuchDataset(path.to_string()));
        }

        let parsed: DatasetAttributes = serde_json::from_value(Value::Object(attributes))
            .map_err(|source| ReaderError::Json {
                path: path.to_string(),
                source,
            })?;
        if parsed.dimensions.len() != parsed.block_size.len() {
            return Err(ReaderError::InvalidAttribute {
                path: path.to_string(),
                key: "blockSize".to_string(),
                reason: format!(
                    "{} block dimensions for {} image dimensions",
                    parsed.block_size.len(),
                    parsed.dimensions.len()
                ),
            });
        }
        if parsed.block_size.contains(&0) {
            return Err(ReaderError::InvalidAttribute {
                path: path.to_string(),
                key: "blockSize".to_string(),
                reason: "block dimensions must be positive".to_string(),
            });
        }
        Ok(parsed)
    }

    /// Check whether `path` is a dataset (has shape metadata)
    fn is_dataset(&self, path: &str) -> bool {
        self.attributes(path)
            .map(|attributes| attributes.contains_key("dimensions"))
            .unwrap_or(false)
    }
}

impl<'a> dyn DatasetReader + 'a {
    /// One attribute at `path`, deserialized into `T`
    pub fn attribute_as<T: DeserializeOwned>(&self, path: &str, key: &str) -> ReaderResult<Option<T>> {
        match self.attribute(path, key)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|err| {
                ReaderError::InvalidAttribute {
                    path: path.to_string(),
                    key: key.to_string(),
                    reason: err.to_string(),
                }
            }),
        }
    }
}

/// Join two hierarchy paths
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if parent.is_empty() {
        child.to_string()
    } else if child.is_empty() {
        parent.to_string()
    } else {
        format!("{}/{}", parent, child)
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Thread-safe in-memory reader
///
/// Paths are created implicitly when attributes or blocks are written to
/// them or to a descendant.
///
/// # Example
///
/// ```
/// use volcache_core::{DatasetAttributes, DatasetReader, InMemoryReader};
///
/// let reader = InMemoryReader::new();
/// reader.create_dataset(
///     "seg/s0",
///     &DatasetAttributes::label_multiset(vec![64, 64, 8], vec![32, 32, 8]),
/// );
///
/// assert!(reader.exists("seg"));
/// assert_eq!(reader.list("seg").unwrap(), vec!["s0".to_string()]);
/// assert_eq!(reader.dataset_attributes("seg/s0").unwrap().block_size, vec![32, 32, 8]);
/// ```
#[derive(Default)]
pub struct InMemoryReader {
    attributes: RwLock<HashMap<String, Attributes>>,
    blocks: RwLock<HashMap<(String, Vec<u64>), Vec<u8>>>,
    block_reads: AtomicUsize,
}

impl InMemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `attributes` into the attributes at `path`
    pub fn set_attributes(&self, path: &str, attributes: Attributes) {
        self.attributes
            .write()
            .entry(normalize(path))
            .or_default()
            .extend(attributes);
    }

    /// Set one attribute at `path`
    pub fn set_attribute<T: Serialize>(&self, path: &str, key: &str, value: T) -> ReaderResult<()> {
        let value = serde_json::to_value(value).map_err(|source| ReaderError::Json {
            path: path.to_string(),
            source,
        })?;
        let mut attributes = Attributes::new();
        attributes.insert(key.to_string(), value);
        self.set_attributes(path, attributes);
        Ok(())
    }

    /// Create a group with no attributes
    pub fn create_group(&self, path: &str) {
        self.set_attributes(path, Attributes::new());
    }

    /// Create a dataset from shape metadata
    pub fn create_dataset(&self, path: &str, attributes: &DatasetAttributes) {
        if let Ok(Value::Object(map)) = serde_json::to_value(attributes) {
            self.set_attributes(path, map);
        }
    }

    /// Store raw block bytes (header included)
    pub fn write_block(&self, dataset: &str, grid_position: &[u64], bytes: Vec<u8>) {
        self.blocks
            .write()
            .insert((normalize(dataset), grid_position.to_vec()), bytes);
    }

    /// Number of `read_block` calls so far
    pub fn block_reads(&self) -> usize {
        self.block_reads.load(Ordering::SeqCst)
    }

    fn known_paths(&self) -> BTreeSet<String> {
        let mut paths: BTreeSet<String> = self.attributes.read().keys().cloned().collect();
        paths.extend(self.blocks.read().keys().map(|(dataset, _)| dataset.clone()));
        paths
    }
}

impl DatasetReader for InMemoryReader {
    fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        if path.is_empty() {
            return true;
        }
        let prefix = format!("{}/", path);
        self.known_paths()
            .iter()
            .any(|known| *known == path || known.starts_with(&prefix))
    }

    fn list(&self, path: &str) -> ReaderResult<Vec<String>> {
        let path = normalize(path);
        if !self.exists(&path) {
            return Err(ReaderError::NoSuchDataset(path));
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let children: BTreeSet<String> = self
            .known_paths()
            .iter()
            .filter_map(|known| known.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|child| !child.is_empty())
            .map(str::to_string)
            .collect();
        Ok(children.into_iter().collect())
    }

    fn attributes(&self, path: &str) -> ReaderResult<Attributes> {
        Ok(self
            .attributes
            .read()
            .get(&normalize(path))
            .cloned()
            .unwrap_or_default())
    }

    fn read_block(&self, dataset: &str, grid_position: &[u64]) -> ReaderResult<Option<Vec<u8>>> {
        self.block_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .blocks
            .read()
            .get(&(normalize(dataset), grid_position.to_vec()))
            .cloned())
    }
}
