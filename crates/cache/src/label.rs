//! Label multiset payload
//!
//! Every voxel of a label multiset cell holds a small multiset of label ids
//! with counts (the labels of the full-resolution voxels it summarizes).
//! Voxels with identical multisets share one list.
//!
//! Serialized layout (big-endian):
//!
//! ```text
//! i32              argmax count (0 or number of voxels)
//! i64 * argmax     per-voxel most frequent label
//! i32 * voxels     byte offset of each voxel's list in the list data
//! list data        per list: i32 entry count, then (i64 id, i32 count) entries
//! ```

use crate::cell::CellData;
use crate::error::LoadError;
use std::collections::{BTreeSet, HashMap};

/// Background label
pub const BACKGROUND: u64 = 0;

/// Label of voxels that carry no information
pub const TRANSPARENT: u64 = u64::MAX;

/// Label of placeholder voxels whose data is not loaded yet
pub const INVALID: u64 = u64::MAX - 1;

/// Label of voxels outside the image
pub const OUTSIDE: u64 = u64::MAX - 2;

/// Largest regular label id
pub const MAX_ID: u64 = u64::MAX - 3;

/// Check whether `id` is one of the reserved labels
pub fn is_reserved(id: u64) -> bool {
    id > MAX_ID
}

const LIST_HEADER_BYTES: usize = 4;
const ENTRY_BYTES: usize = 12;

/// One (label, count) pair of a multiset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelMultisetEntry {
    pub id: u64,
    pub count: u32,
}

impl LabelMultisetEntry {
    pub fn new(id: u64, count: u32) -> Self {
        Self { id, count }
    }
}

/// Per-voxel label multisets of one cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMultisetArray {
    /// Index into `lists` for every voxel
    voxels: Vec<u32>,
    /// Distinct multisets, entries sorted by id
    lists: Vec<Vec<LabelMultisetEntry>>,
    /// Most frequent label per voxel; empty when not precomputed
    arg_max: Vec<u64>,
    valid: bool,
}

impl LabelMultisetArray {
    /// Build a valid array where every voxel holds exactly one label
    pub fn from_labels(labels: &[u64]) -> Self {
        let mut list_of_label: HashMap<u64, u32> = HashMap::new();
        let mut lists = Vec::new();
        let voxels = labels
            .iter()
            .map(|&label| {
                *list_of_label.entry(label).or_insert_with(|| {
                    lists.push(vec![LabelMultisetEntry::new(label, 1)]);
                    (lists.len() - 1) as u32
                })
            })
            .collect();

        Self {
            voxels,
            lists,
            arg_max: labels.to_vec(),
            valid: true,
        }
    }

    /// Build a valid array where every voxel holds `BACKGROUND`
    pub fn background(num_elements: usize) -> Self {
        Self {
            voxels: vec![0; num_elements],
            lists: vec![vec![LabelMultisetEntry::new(BACKGROUND, 1)]],
            arg_max: Vec::new(),
            valid: true,
        }
    }

    /// Build the placeholder array: every voxel holds `INVALID` once and the
    /// array is flagged invalid
    pub fn invalid(num_elements: usize) -> Self {
        Self {
            voxels: vec![0; num_elements],
            lists: vec![vec![LabelMultisetEntry::new(INVALID, 1)]],
            arg_max: Vec::new(),
            valid: false,
        }
    }

    /// Number of voxels
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Check whether the data is real (as opposed to a placeholder)
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Number of distinct multisets
    pub fn num_lists(&self) -> usize {
        self.lists.len()
    }

    /// Multiset of the voxel at flat position `voxel`
    ///
    /// # Panics
    ///
    /// Panics if `voxel >= self.len()`.
    pub fn entries(&self, voxel: usize) -> &[LabelMultisetEntry] {
        &self.lists[self.voxels[voxel] as usize]
    }

    /// Most frequent label of the voxel at flat position `voxel`
    ///
    /// Ties go to the smaller id.
    pub fn arg_max(&self, voxel: usize) -> u64 {
        if let Some(&label) = self.arg_max.get(voxel) {
            return label;
        }

        let mut best = LabelMultisetEntry::new(BACKGROUND, 0);
        for entry in self.entries(voxel) {
            if entry.count > best.count || (entry.count == best.count && entry.id < best.id) {
                best = *entry;
            }
        }
        best.id
    }

    /// Set of labels that occur anywhere in the array
    pub fn contained_labels(&self) -> BTreeSet<u64> {
        let mut used = vec![false; self.lists.len()];
        for &list in &self.voxels {
            used[list as usize] = true;
        }

        self.lists
            .iter()
            .zip(used)
            .filter(|(_, used)| *used)
            .flat_map(|(list, _)| list.iter().map(|entry| entry.id))
            .collect()
    }

    /// Decode a serialized array holding `num_elements` voxels
    pub fn decode(bytes: &[u8], num_elements: usize) -> Result<Self, LoadError> {
        let mut reader = ByteReader::new(bytes);

        let arg_max_size = reader.read_i32()?;
        if arg_max_size != 0 && arg_max_size as usize != num_elements {
            return Err(LoadError::Decode(format!(
                "argmax holds {} labels for {} voxels",
                arg_max_size, num_elements
            )));
        }
        let arg_max = (0..arg_max_size)
            .map(|_| reader.read_i64().map(|v| v as u64))
            .collect::<Result<Vec<_>, _>>()?;

        let offsets = (0..num_elements)
            .map(|_| reader.read_i32())
            .collect::<Result<Vec<_>, _>>()?;

        let list_data = reader.remaining();
        let mut list_of_offset: HashMap<i32, u32> = HashMap::new();
        let mut lists = Vec::new();
        let mut voxels = Vec::with_capacity(num_elements);

        for offset in offsets {
            let list = match list_of_offset.get(&offset) {
                Some(&list) => list,
                None => {
                    lists.push(decode_list(list_data, offset)?);
                    let list = (lists.len() - 1) as u32;
                    list_of_offset.insert(offset, list);
                    list
                }
            };
            voxels.push(list);
        }

        Ok(Self {
            voxels,
            lists,
            arg_max,
            valid: true,
        })
    }

    /// Serialize in the layout read by [`LabelMultisetArray::decode`]
    pub fn encode(&self) -> Vec<u8> {
        let mut list_offsets = Vec::with_capacity(self.lists.len());
        let mut list_data = Vec::new();
        for list in &self.lists {
            list_offsets.push(list_data.len() as i32);
            list_data.extend_from_slice(&(list.len() as i32).to_be_bytes());
            for entry in list {
                list_data.extend_from_slice(&(entry.id as i64).to_be_bytes());
                list_data.extend_from_slice(&(entry.count as i32).to_be_bytes());
            }
        }

        let mut bytes = Vec::with_capacity(4 + self.len() * 12 + list_data.len());
        bytes.extend_from_slice(&(self.len() as i32).to_be_bytes());
        for voxel in 0..self.len() {
            bytes.extend_from_slice(&(self.arg_max(voxel) as i64).to_be_bytes());
        }
        for &list in &self.voxels {
            bytes.extend_from_slice(&list_offsets[list as usize].to_be_bytes());
        }
        bytes.extend_from_slice(&list_data);
        bytes
    }
}

impl CellData for LabelMultisetArray {
    fn memory_size(&self) -> usize {
        let lists: usize = self
            .lists
            .iter()
            .map(|list| LIST_HEADER_BYTES + list.len() * ENTRY_BYTES)
            .sum();
        self.voxels.len() * 4 + self.arg_max.len() * 8 + lists
    }
}

fn decode_list(list_data: &[u8], offset: i32) -> Result<Vec<LabelMultisetEntry>, LoadError> {
    let start = usize::try_from(offset)
        .ok()
        .filter(|&start| start < list_data.len())
        .ok_or_else(|| LoadError::Decode(format!("list offset {} out of range", offset)))?;

    let mut reader = ByteReader::new(&list_data[start..]);
    let size = reader.read_i32()?;
    if size < 0 {
        return Err(LoadError::Decode(format!("negative list size {}", size)));
    }

    (0..size)
        .map(|_| {
            let id = reader.read_i64()? as u64;
            let count = reader.read_i32()?;
            Ok(LabelMultisetEntry::new(id, count as u32))
        })
        .collect()
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], LoadError> {
        let end = self.position + N;
        let chunk = self
            .bytes
            .get(self.position..end)
            .ok_or_else(|| {
                LoadError::Decode(format!(
                    "unexpected end of data at byte {} of {}",
                    self.position,
                    self.bytes.len()
                ))
            })?;
        self.position = end;

        let mut array = [0u8; N];
        array.copy_from_slice(chunk);
        Ok(array)
    }

    fn read_i32(&mut self) -> Result<i32, LoadError> {
        self.take::<4>().map(i32::from_be_bytes)
    }

    fn read_i64(&mut self) -> Result<i64, LoadError> {
        self.take::<8>().map(i64::from_be_bytes)
    }

    fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.position..]
    }
}
