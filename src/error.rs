//! Error taxonomy for the storage engine.
//

use std::path::PathBuf;

/// Errors surfaced across the varint codec, store, list and shard layers.
///
/// `NotFoundError` from the taxonomy is deliberately absent here: a missing
/// key is not exceptional, it is represented by an empty list handle at the
/// API boundary (see `Shard::get_shared`/`get_unique`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("domain error: {0}")]
    Domain(String),

    #[error("block id {id} is out of range (store holds {num_blocks} blocks)")]
    OutOfRange { id: u32, num_blocks: u32 },

    #[error("incompatible block size: on-disk store uses {on_disk}, requested {requested}")]
    Incompatible { on_disk: u32, requested: u32 },

    #[error("corruption detected in {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    IoPlain(#[from] std::io::Error),
}

impl Error {
    pub fn domain<S: Into<String>>(msg: S) -> Self {
        Error::Domain(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Internal signal used by the varint codec and the block writer: the
/// destination buffer held too few free bytes for the requested write. The
/// list recovers from this locally by flushing the current block and
/// retrying; it never escapes to callers of the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError;

impl std::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "destination buffer has insufficient capacity")
    }
}

impl std::error::Error for CapacityError {}
