//! Storage errors.

use std::io;
use thiserror::Error;

/// Result alias for storage calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a backend or file factory.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system reported an error.
    #[error("storage I/O: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes the file does not hold yet.
    #[error("read of {len} bytes at offset {offset} passes the end of a {size}-byte file")]
    ReadPastEnd {
        /// Offset asked for.
        offset: u64,
        /// Length asked for.
        len: usize,
        /// File size at the time of the read.
        size: u64,
    },

    /// Truncation can only shorten a file.
    #[error("cannot grow a {size}-byte file to {new_size} bytes by truncation")]
    TruncatePastEnd {
        /// Requested size.
        new_size: u64,
        /// File size at the time of the call.
        size: u64,
    },

    /// No file has this name.
    #[error("no such file: {0}")]
    NotFound(String),

    /// The directory's `LOCK` file is held by another owner.
    #[error("{0} is locked by another journal or paging manager")]
    Locked(String),

    /// Names must be non-empty and free of path separators.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
}

impl StorageError {
    /// Returns whether the error means the file is missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
