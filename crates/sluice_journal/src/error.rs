//! Error types for the journal.

use crate::types::{SegmentId, TransactionId};
use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur in journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] sluice_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record failed to decode (checksum, magic, tag, version or body).
    #[error("corrupt record: {reason}")]
    CorruptRecord {
        /// Why the record was rejected.
        reason: String,
    },

    /// A record declares more bytes than remain.
    #[error("truncated record: needed {needed} bytes, {available} available")]
    TruncatedRecord {
        /// Bytes the record needs.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// Damage that cannot be explained as an interrupted final append.
    #[error("journal corruption in segment {segment} at offset {offset}: {reason}")]
    JournalCorruption {
        /// Segment holding the damaged record.
        segment: SegmentId,
        /// Offset of the damaged record.
        offset: u64,
        /// Description of the damage.
        reason: String,
    },

    /// Commit or rollback of a transaction with no matching prepare.
    #[error("unknown transaction {tx_id}")]
    UnknownTransaction {
        /// The transaction.
        tx_id: TransactionId,
    },

    /// The transaction is in the wrong state for the requested operation.
    #[error("invalid state for transaction {tx_id}: {message}")]
    InvalidTransactionState {
        /// The transaction.
        tx_id: TransactionId,
        /// What was attempted.
        message: String,
    },

    /// A write failed; the journal refuses every further call.
    #[error("journal I/O failure: {message}")]
    IoFailure {
        /// Description of the original failure.
        message: String,
    },

    /// An append or transaction call arrived before `load`.
    #[error("journal not loaded")]
    NotLoaded,

    /// `load` was called twice.
    #[error("journal already loaded")]
    AlreadyLoaded,

    /// Another compaction run is active.
    #[error("compaction already in progress")]
    CompactionInProgress,

    /// A compaction run was aborted; the previous segment set is intact.
    #[error("compaction failed: {message}")]
    CompactionFailed {
        /// Why the run was aborted.
        message: String,
    },

    /// Another process holds the journal directory.
    #[error("journal directory locked: {0}")]
    Locked(String),

    /// An argument was rejected before anything was written.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },
}

impl JournalError {
    /// Creates a corrupt record error.
    pub fn corrupt_record(reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            reason: reason.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn corruption(segment: SegmentId, offset: u64, reason: impl Into<String>) -> Self {
        Self::JournalCorruption {
            segment,
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an invalid transaction state error.
    pub fn invalid_state(tx_id: TransactionId, message: impl Into<String>) -> Self {
        Self::InvalidTransactionState {
            tx_id,
            message: message.into(),
        }
    }

    /// Creates an I/O failure error.
    pub fn io_failure(message: impl Into<String>) -> Self {
        Self::IoFailure {
            message: message.into(),
        }
    }

    /// Creates a compaction failed error.
    pub fn compaction_failed(message: impl Into<String>) -> Self {
        Self::CompactionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Maps storage lock failures to [`JournalError::Locked`].
    pub(crate) fn from_open(err: sluice_storage::StorageError) -> Self {
        match err {
            sluice_storage::StorageError::Locked(path) => Self::Locked(path),
            other => Self::Storage(other),
        }
    }
}
