//! Segment files and their lifecycle.
//!
//! ## Layout
//!
//! ```text
//! <journal_dir>/
//! ├─ LOCK                              # exclusive advisory lock
//! ├─ COMPACT                           # present only while a compaction publishes
//! ├─ sluice-00000000000000000001.jrn   # sealed segment
//! ├─ sluice-00000000000000000002.jrn   # writable segment
//! └─ sluice-00000000000000000003.jrn   # pre-allocated, empty
//! ```
//!
//! ## States
//!
//! `Writable -> Full -> Reclaimable -> Deleted`. Exactly one segment is
//! writable. A full segment becomes reclaimable once none of its bytes
//! are live. Only the oldest run of reclaimable segments is deleted outside
//! compaction: a dead segment that follows a surviving one may hold the
//! delete markers that keep older records dead.

mod file;
mod manager;
mod naming;
mod reader;

pub use file::SegmentFile;
pub use manager::{SegmentInfo, SegmentManager, SegmentState};
pub use naming::{SegmentNaming, COMPACTING_EXTENSION};
pub use reader::{ScannedRecord, SegmentRecords};

pub(crate) use manager::PublishedSegments;
pub(crate) use reader::ScanError;
