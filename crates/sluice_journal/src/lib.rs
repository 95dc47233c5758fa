//! # Sluice Journal
//!
//! Segmented, append-only journal for a message broker.
//!
//! This crate provides:
//! - A self-delimiting, checksummed record codec
//! - Fixed-capacity segment files with rotation and reclamation
//! - Transactional appends (prepare / commit / rollback) with recovery
//! - Online compaction that runs concurrently with appends
//! - An ordered replication feed of written records
//! - Offline inspection for tooling
//!
//! ## Example
//!
//! ```rust,no_run
//! use sluice_journal::{Journal, JournalConfig};
//! use std::path::Path;
//!
//! let journal = Journal::open(Path::new("/var/lib/broker/journal"), JournalConfig::default())?;
//! let loaded = journal.load()?;
//! println!("recovered {} records", loaded.records.len());
//!
//! journal.add(42, 1, b"message".to_vec())?;
//! let compactor = journal.spawn_compactor()?;
//! // ...
//! compactor.stop();
//! # Ok::<(), sluice_journal::JournalError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compactor;
mod config;
mod error;
pub mod inspect;
mod journal;
mod record;
mod segment;
mod stats;
mod types;

pub use compactor::{CompactionReport, CompactorHandle};
pub use config::{CompactionPolicy, JournalConfig};
pub use error::{JournalError, JournalResult};
pub use journal::{
    Journal, LoadSummary, LoadedJournal, PreparedTransaction, ReplicatedRecord, CONTROL_FILE,
};
pub use record::{
    compute_crc32, JournalRecord, OpKind, Record, RecordTag, HEADER_SIZE, MIN_RECORD_SIZE,
    RECORD_MAGIC, RECORD_VERSION, TRAILER_SIZE,
};
pub use segment::{
    ScannedRecord, SegmentFile, SegmentInfo, SegmentManager, SegmentNaming, SegmentRecords,
    SegmentState, COMPACTING_EXTENSION,
};
pub use stats::{JournalStats, JournalStatsSnapshot};
pub use types::{Location, SegmentId, TransactionId};
