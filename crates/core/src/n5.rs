//! N5 filesystem container
//!
//! Layout on disk:
//!
//! ```text
//! <root>/attributes.json
//! <root>/<group>/attributes.json
//! <root>/<group>/<dataset>/attributes.json
//! <root>/<group>/<dataset>/<x>/<y>/<z>
//! ```
//!
//! Each block file starts with a big-endian header: `u16` mode, `u16`
//! number of dimensions, one `u32` per dimension for the block shape and,
//! for mode 1 (variable length), a `u32` element count. Label multiset
//! blocks are written in mode 1 with the voxel count.

use crate::error::{ReaderError, ReaderResult};
use crate::reader::{Attributes, DatasetAttributes, DatasetReader};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const ATTRIBUTES_FILE: &str = "attributes.json";

const MODE_DEFAULT: u16 = 0;
const MODE_VARLENGTH: u16 = 1;

/// Header of one N5 block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub mode: u16,
    pub block_size: Vec<u32>,
    /// Element count of variable length blocks
    pub num_elements: Option<u32>,
}

impl BlockHeader {
    /// Header of a variable length block
    pub fn varlength(block_size: Vec<u32>, num_elements: u32) -> Self {
        Self {
            mode: MODE_VARLENGTH,
            block_size,
            num_elements: Some(num_elements),
        }
    }

    /// Number of elements the payload describes
    pub fn element_count(&self) -> usize {
        match self.num_elements {
            Some(n) => n as usize,
            None => self.block_size.iter().map(|&d| d as usize).product(),
        }
    }

    fn encoded_len(&self) -> usize {
        4 + 4 * self.block_size.len() + if self.num_elements.is_some() { 4 } else { 0 }
    }
}

/// Split a block into header and payload
pub fn decode_block(bytes: &[u8]) -> ReaderResult<(BlockHeader, &[u8])> {
    fn read_u16(bytes: &[u8], at: usize) -> ReaderResult<u16> {
        bytes
            .get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| ReaderError::BlockHeader(format!("truncated at byte {}", at)))
    }
    fn read_u32(bytes: &[u8], at: usize) -> ReaderResult<u32> {
        bytes
            .get(at..at + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| ReaderError::BlockHeader(format!("truncated at byte {}", at)))
    }

    let mode = read_u16(bytes, 0)?;
    if mode != MODE_DEFAULT && mode != MODE_VARLENGTH {
        return Err(ReaderError::BlockHeader(format!("unknown mode {}", mode)));
    }
    let ndim = read_u16(bytes, 2)? as usize;
    if ndim == 0 {
        return Err(ReaderError::BlockHeader("ndim 0".to_string()));
    }

    let mut offset = 4;
    let mut block_size = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        block_size.push(read_u32(bytes, offset)?);
        offset += 4;
    }

    let num_elements = if mode == MODE_VARLENGTH {
        let n = read_u32(bytes, offset)?;
        offset += 4;
        Some(n)
    } else {
        None
    };

    let header = BlockHeader {
        mode,
        block_size,
        num_elements,
    };
    Ok((header, &bytes[offset..]))
}

/// Prefix `payload` with an encoded header
pub fn encode_block(header: &BlockHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.encoded_len() + payload.len());
    out.extend_from_slice(&header.mode.to_be_bytes());
    out.extend_from_slice(&(header.block_size.len() as u16).to_be_bytes());
    for d in &header.block_size {
        out.extend_from_slice(&d.to_be_bytes());
    }
    if let Some(n) = header.num_elements {
        out.extend_from_slice(&n.to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

fn relative(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn resolve(root: &Path, path: &str) -> PathBuf {
    let mut resolved = root.to_path_buf();
    resolved.extend(relative(path));
    resolved
}

fn block_path(root: &Path, dataset: &str, grid_position: &[u64]) -> PathBuf {
    let mut path = resolve(root, dataset);
    path.extend(grid_position.iter().map(|p| p.to_string()));
    path
}

fn io_error(path: &Path, source: io::Error) -> ReaderError {
    ReaderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_attributes_file(file: &Path) -> ReaderResult<Attributes> {
    let text = match fs::read_to_string(file) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Attributes::new()),
        Err(err) => return Err(io_error(file, err)),
    };
    serde_json::from_str(&text).map_err(|source| ReaderError::Json {
        path: file.display().to_string(),
        source,
    })
}

/// Read-only view of an N5 container on the local filesystem
#[derive(Debug, Clone)]
pub struct N5FsReader {
    root: PathBuf,
}

impl N5FsReader {
    /// Open the container at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> ReaderResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(io_error(
                &root,
                io::Error::new(io::ErrorKind::NotFound, "container root is not a directory"),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DatasetReader for N5FsReader {
    fn exists(&self, path: &str) -> bool {
        resolve(&self.root, path).is_dir()
    }

    fn list(&self, path: &str) -> ReaderResult<Vec<String>> {
        let dir = resolve(&self.root, path);
        let entries = fs::read_dir(&dir).map_err(|err| io_error(&dir, err))?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&dir, err))?;
            let is_dir = entry
                .file_type()
                .map(|kind| kind.is_dir())
                .map_err(|err| io_error(&entry.path(), err))?;
            if is_dir {
                children.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        children.sort();
        Ok(children)
    }

    fn attributes(&self, path: &str) -> ReaderResult<Attributes> {
        read_attributes_file(&resolve(&self.root, path).join(ATTRIBUTES_FILE))
    }

    fn read_block(&self, dataset: &str, grid_position: &[u64]) -> ReaderResult<Option<Vec<u8>>> {
        let file = block_path(&self.root, dataset, grid_position);
        match fs::read(&file) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&file, err)),
        }
    }
}

/// Writer for N5 containers on the local filesystem
///
/// Used to build fixtures; the cache itself only reads.
#[derive(Debug, Clone)]
pub struct N5FsWriter {
    root: PathBuf,
}

impl N5FsWriter {
    /// Create (or reuse) the container at `root`
    pub fn create<P: AsRef<Path>>(root: P) -> ReaderResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| io_error(&root, err))?;
        let writer = Self { root };
        writer.set_attribute("", "n5", "2.5.1")?;
        Ok(writer)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A reader over the same container
    pub fn reader(&self) -> N5FsReader {
        N5FsReader {
            root: self.root.clone(),
        }
    }

    pub fn create_group(&self, path: &str) -> ReaderResult<()> {
        let dir = resolve(&self.root, path);
        fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))
    }

    /// Merge `attributes` into the attributes file at `path`
    pub fn set_attributes(&self, path: &str, attributes: Attributes) -> ReaderResult<()> {
        self.create_group(path)?;
        let file = resolve(&self.root, path).join(ATTRIBUTES_FILE);
        let mut merged = read_attributes_file(&file)?;
        merged.extend(attributes);

        let text = serde_json::to_string_pretty(&Value::Object(merged)).map_err(|source| {
            ReaderError::Json {
                path: file.display().to_string(),
                source,
            }
        })?;
        fs::write(&file, text).map_err(|err| io_error(&file, err))
    }

    pub fn set_attribute<T: Serialize>(&self, path: &str, key: &str, value: T) -> ReaderResult<()> {
        let value = serde_json::to_value(value).map_err(|source| ReaderError::Json {
            path: path.to_string(),
            source,
        })?;
        let mut attributes = Attributes::new();
        attributes.insert(key.to_string(), value);
        self.set_attributes(path, attributes)
    }

    pub fn create_dataset(&self, path: &str, attributes: &DatasetAttributes) -> ReaderResult<()> {
        let value = serde_json::to_value(attributes).map_err(|source| ReaderError::Json {
            path: path.to_string(),
            source,
        })?;
        match value {
            Value::Object(map) => self.set_attributes(path, map),
            _ => Err(ReaderError::InvalidAttribute {
                path: path.to_string(),
                key: "dimensions".to_string(),
                reason: "dataset attributes must serialize to an object".to_string(),
            }),
        }
    }

    /// Write raw block bytes (header included)
    pub fn write_block(&self, dataset: &str, grid_position: &[u64], bytes: &[u8]) -> ReaderResult<()> {
        let file = block_path(&self.root, dataset, grid_position);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        fs::write(&file, bytes).map_err(|err| io_error(&file, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = BlockHeader::varlength(vec![32, 32, 8], 8192);
        let bytes = encode_block(&header, &[0xAB]);

        assert_eq!(&bytes[0..2], &[0, 1]);
        assert_eq!(&bytes[2..4], &[0, 3]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 32]);
        assert_eq!(&bytes[16..20], &8192u32.to_be_bytes());
        assert_eq!(bytes.len(), 21);

        let (decoded, payload) = decode_block(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, &[0xAB]);
        assert_eq!(decoded.element_count(), 8192);
    }

    #[test]
    fn test_default_mode_element_count() {
        let header = BlockHeader {
            mode: 0,
            block_size: vec![4, 4, 2],
            num_elements: None,
        };
        let bytes = encode_block(&header, &[]);
        let (decoded, payload) = decode_block(&bytes).unwrap();
        assert_eq!(decoded.element_count(), 32);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_malformed_headers() {
        assert!(decode_block(&[0]).is_err());
        assert!(decode_block(&[0, 7, 0, 1, 0, 0, 0, 1]).is_err());
        assert!(decode_block(&[0, 0, 0, 0]).is_err());
        assert!(decode_block(&[0, 1, 0, 1, 0, 0, 0, 4]).is_err());
    }

    #[test]
    fn test_filesystem_container() {
        let dir = tempfile::tempdir().unwrap();
        let writer = N5FsWriter::create(dir.path()).unwrap();
        writer
            .create_dataset(
                "seg/s0",
                &DatasetAttributes::label_multiset(vec![64, 64, 8], vec![32, 32, 8]),
            )
            .unwrap();
        writer.set_attribute("seg/s0", "resolution", [4.0, 4.0, 40.0]).unwrap();
        writer.write_block("seg/s0", &[1, 0, 0], &[1, 2, 3]).unwrap();

        let reader = N5FsReader::open(dir.path()).unwrap();
        assert!(reader.exists("seg"));
        assert!(!reader.exists("raw"));
        assert_eq!(reader.list("seg").unwrap(), vec!["s0"]);
        assert!(reader.is_dataset("seg/s0"));

        let attrs = reader.dataset_attributes("seg/s0").unwrap();
        assert_eq!(attrs.dimensions, vec![64, 64, 8]);
        assert!(reader.attribute("seg/s0", "resolution").unwrap().is_some());
        assert_eq!(reader.attribute("", "n5").unwrap(), Some(Value::from("2.5.1")));

        assert_eq!(reader.read_block("seg/s0", &[1, 0, 0]).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(reader.read_block("seg/s0", &[0, 0, 0]).unwrap(), None);
    }

    #[test]
    fn test_open_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(N5FsReader::open(dir.path().join("absent")).is_err());
    }
}
