//! Error types for paging.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for paging operations.
pub type PagingResult<T> = Result<T, PagingError>;

/// Errors that can occur in paging operations.
#[derive(Debug, Error)]
pub enum PagingError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] sluice_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The address is full and its policy rejects new messages.
    #[error("address {address} is full")]
    AddressFull {
        /// The address.
        address: String,
    },

    /// A blocked send waited too long for memory to free up.
    #[error("send to {address} blocked for {waited:?} without space")]
    Timeout {
        /// The address.
        address: String,
        /// How long the send waited.
        waited: Duration,
    },

    /// A page holds damage that is not an interrupted final write.
    #[error("corrupt page {page_id} at offset {offset}: {reason}")]
    CorruptPage {
        /// The damaged page.
        page_id: u64,
        /// Offset of the damaged message.
        offset: u64,
        /// Description of the damage.
        reason: String,
    },

    /// A page write failed; the store refuses every further page call.
    #[error("paging I/O failure: {message}")]
    IoFailure {
        /// Description of the original failure.
        message: String,
    },

    /// An argument was rejected.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },
}

impl PagingError {
    /// Creates a corrupt page error.
    pub fn corrupt_page(page_id: u64, offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptPage {
            page_id,
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an I/O failure error.
    pub fn io_failure(message: impl Into<String>) -> Self {
        Self::IoFailure {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PagingError::corrupt_page(3, 40, "checksum mismatch");
        assert_eq!(
            err.to_string(),
            "corrupt page 3 at offset 40: checksum mismatch"
        );

        let err = PagingError::AddressFull {
            address: "orders".into(),
        };
        assert_eq!(err.to_string(), "address orders is full");
    }
}
