//! Error surface of the disk layer.
//!
//! Object adapters speak `anyhow::Result` (like the rest of the object layer);
//! everything crossing the disk boundary is folded into [`DiskError`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("range out of bounds: offset {offset} length {length} capacity {capacity}")]
    OutOfRange {
        offset: u64,
        length: u64,
        capacity: u64,
    },

    #[error("invalid range: start {start} > end {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("block size must be non-zero")]
    InvalidBlockSize,

    #[error("chunk size must be non-zero")]
    InvalidChunkSize,

    #[error("backend error: {0:#}")]
    Backend(#[source] anyhow::Error),

    #[error("mount failed: {0}")]
    Mount(String),

    #[error("trim failed: {0:#}")]
    Trim(#[source] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiskError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        DiskError::Backend(err.into())
    }

    pub fn out_of_range(offset: u64, length: u64, capacity: u64) -> Self {
        DiskError::OutOfRange {
            offset,
            length,
            capacity,
        }
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
