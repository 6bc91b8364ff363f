//! Error types for dataset access, pyramid construction and the runtime

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use volcache_cache::{CacheError, ConfigError, LoadError};

/// Errors raised by a [`DatasetReader`](crate::DatasetReader)
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed attributes at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("dataset {0} does not exist")]
    NoSuchDataset(String),

    #[error("attribute {key} of {path} is missing or malformed: {reason}")]
    InvalidAttribute {
        path: String,
        key: String,
        reason: String,
    },

    #[error("dataset {dataset} uses unsupported compression {compression}")]
    UnsupportedCompression { dataset: String, compression: String },

    #[error("malformed block header: {0}")]
    BlockHeader(String),
}

pub type ReaderResult<T> = Result<T, ReaderError>;

impl From<ReaderError> for LoadError {
    fn from(err: ReaderError) -> Self {
        match err {
            ReaderError::Io { source, .. } => LoadError::Io(Arc::new(source)),
            ReaderError::BlockHeader(reason) => LoadError::Decode(reason),
            other => LoadError::Other(other.to_string()),
        }
    }
}

/// Errors that abort a multiscale pyramid load
#[derive(Debug, thiserror::Error)]
pub enum PyramidError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("group {0} contains no scale datasets")]
    NoScaleDatasets(String),

    #[error("{dataset} has {found} dimensions, expected 3")]
    NotThreeDimensional { dataset: String, found: usize },

    #[error("{what} needs 3 components, got {found}")]
    InvalidVector { what: &'static str, found: usize },

    #[error("{dataset} has no downsamplingFactors; only the finest level may omit them")]
    MissingDownsamplingFactors { dataset: String },

    #[error("invalid downsamplingFactors {factors:?} in {dataset}: {reason}")]
    InvalidDownsamplingFactors {
        dataset: String,
        factors: Vec<f64>,
        reason: &'static str,
    },
}

pub type PyramidResult<T> = Result<T, PyramidError>;

/// Errors starting a [`CacheRuntime`](crate::CacheRuntime)
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to start fetcher threads: {0}")]
    Workers(#[source] io::Error),
}
