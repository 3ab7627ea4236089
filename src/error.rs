//! Crate-wide error type.
//!
//! Variants fall into four groups: format errors raised while opening a
//! file, capacity errors raised by insertion, logical conflicts raised by
//! the key/value API, and lifecycle errors around disposal.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid {file} file: bad magic number {found:#018x}")]
    BadMagic { file: &'static str, found: u64 },

    #[error("{file} file format mismatch: {field} is {found}, expected {expected}")]
    FormatMismatch {
        file: &'static str,
        field: &'static str,
        found: u64,
        expected: u64,
    },

    #[error("{file} file is truncated: {len} bytes, need at least {needed}")]
    Truncated {
        file: &'static str,
        len: u64,
        needed: u64,
    },

    #[error("corrupt value log entry at offset {offset}")]
    CorruptEntry { offset: u64 },

    #[error("reached max allowed distance {max} (table full or hash function degenerate)")]
    MaxDistanceExceeded { max: u32 },

    #[error("probe cluster needs more than {max_locks} chunk locks (table too full)")]
    ClusterTooLong { max_locks: usize },

    #[error("capacity {capacity} needs more slots than a table can address")]
    CapacityTooLarge { capacity: u64 },

    #[error("key already exists")]
    KeyExists,

    #[error("key not found")]
    KeyNotFound,

    #[error("range {offset}..{end} is outside a mapping of {len} bytes")]
    OutOfRange { offset: u64, end: u64, len: u64 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("store has been disposed")]
    Disposed,

    #[error("{} error(s) while disposing: {}", .0.len(), join(.0))]
    Dispose(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Corrupt or foreign file contents.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            Error::BadMagic { .. }
                | Error::FormatMismatch { .. }
                | Error::Truncated { .. }
                | Error::CorruptEntry { .. }
        )
    }

    /// The table cannot place another record.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Error::MaxDistanceExceeded { .. }
                | Error::ClusterTooLong { .. }
                | Error::CapacityTooLarge { .. }
        )
    }

    /// Duplicate or missing key.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KeyExists | Error::KeyNotFound)
    }

    /// Fold a list of release faults into one error, if any occurred.
    pub(crate) fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Dispose(errors)),
        }
    }
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
