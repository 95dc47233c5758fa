//! Journal statistics.
//!
//! All counters are atomic and can be read while appends are in progress.
//!
//! ```rust,ignore
//! let stats = journal.stats();
//! println!("appends: {}", stats.appends);
//! println!("reclaimed: {} bytes", stats.bytes_reclaimed);
//! ```

use crate::record::{JournalRecord, RecordTag};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Journal counters.
#[derive(Debug, Default)]
pub struct JournalStats {
    appends: AtomicU64,
    bytes_written: AtomicU64,
    rotations: AtomicU64,
    prepares: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    compactions: AtomicU64,
    compaction_failures: AtomicU64,
    bytes_reclaimed: AtomicU64,
    errors: AtomicU64,
}

impl JournalStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_append(&self, record: &JournalRecord, bytes: usize) {
        self.appends.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
        let counter = match record.tag() {
            RecordTag::Prepare => &self.prepares,
            RecordTag::Commit => &self.commits,
            RecordTag::Rollback => &self.rollbacks,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self, reclaimed: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction_failure(&self) {
        self.compaction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of records appended.
    pub fn appends(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }

    /// Returns the number of encoded bytes appended.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the number of completed compaction runs.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> JournalStatsSnapshot {
        JournalStatsSnapshot {
            appends: self.appends(),
            bytes_written: self.bytes_written(),
            rotations: self.rotations.load(Ordering::Relaxed),
            prepares: self.prepares.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            compactions: self.compactions(),
            compaction_failures: self.compaction_failures.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of [`JournalStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct JournalStatsSnapshot {
    /// Records appended.
    pub appends: u64,
    /// Encoded bytes appended.
    pub bytes_written: u64,
    /// Segment rotations.
    pub rotations: u64,
    /// Prepare markers written.
    pub prepares: u64,
    /// Commit markers written.
    pub commits: u64,
    /// Rollback markers written.
    pub rollbacks: u64,
    /// Completed compaction runs.
    pub compactions: u64,
    /// Aborted compaction runs.
    pub compaction_failures: u64,
    /// Bytes freed by compaction.
    pub bytes_reclaimed: u64,
    /// Write failures.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;

    #[test]
    fn markers_are_counted_separately() {
        let stats = JournalStats::new();
        let commit = JournalRecord::Commit {
            tx_id: TransactionId(1),
        };
        stats.record_append(&commit, 23);
        stats.record_append(&commit, 23);
        stats.record_compaction(100);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.appends, 2);
        assert_eq!(snapshot.bytes_written, 46);
        assert_eq!(snapshot.commits, 2);
        assert_eq!(snapshot.rollbacks, 0);
        assert_eq!(snapshot.bytes_reclaimed, 100);
    }
}
