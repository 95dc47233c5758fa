//! The loaded journal: current writer, live index and pending transactions.
//!
//! Everything here lives behind the journal's writer lock.

use crate::error::{JournalError, JournalResult};
use crate::journal::control::CONTROL_FILE;
use crate::record::{JournalRecord, OpKind};
use crate::segment::{SegmentFile, SegmentManager};
use crate::stats::JournalStats;
use crate::types::{Location, TransactionId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where the current version of a record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LiveEntry {
    pub(crate) location: Location,
    pub(crate) user_type: u8,
}

/// A buffered operation of an unresolved transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingOp {
    pub(crate) op: OpKind,
    pub(crate) id: u64,
    pub(crate) user_type: u8,
    pub(crate) location: Location,
}

/// An unresolved transaction.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingTx {
    pub(crate) ops: Vec<PendingOp>,
    pub(crate) prepare: Option<Location>,
}

impl PendingTx {
    /// Every location this transaction keeps live.
    pub(crate) fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.ops
            .iter()
            .map(|op| op.location)
            .chain(self.prepare.iter().copied())
    }
}

pub(crate) struct ActiveJournal {
    pub(crate) segments: SegmentManager,
    pub(crate) current: Arc<SegmentFile>,
    pub(crate) live: HashMap<u64, LiveEntry>,
    pub(crate) pending: HashMap<TransactionId, PendingTx>,
    pub(crate) sync_on_write: bool,
    /// A compaction control file is waiting on deferred deletions.
    pub(crate) control_pending: bool,
}

impl ActiveJournal {
    /// Rejects calls that would break the transaction state machine.
    pub(crate) fn check(&self, record: &JournalRecord) -> JournalResult<()> {
        let prepared = |tx_id: &TransactionId| {
            self.pending
                .get(tx_id)
                .is_some_and(|tx| tx.prepare.is_some())
        };

        match record {
            JournalRecord::Operation { record, .. } => match record.tx_id {
                Some(tx_id) if prepared(&tx_id) => Err(JournalError::invalid_state(
                    tx_id,
                    "cannot add operations to a prepared transaction",
                )),
                _ => Ok(()),
            },
            JournalRecord::Prepare { tx_id, .. } if prepared(tx_id) => {
                Err(JournalError::invalid_state(*tx_id, "already prepared"))
            }
            JournalRecord::Prepare { .. } => Ok(()),
            JournalRecord::Commit { tx_id } | JournalRecord::Rollback { tx_id } => {
                if prepared(tx_id) {
                    Ok(())
                } else {
                    Err(JournalError::UnknownTransaction { tx_id: *tx_id })
                }
            }
        }
    }

    /// Encodes a record and checks it fits in a segment.
    pub(crate) fn encode_checked(&self, record: &JournalRecord) -> JournalResult<Vec<u8>> {
        let bytes = record.encode()?;
        if bytes.len() as u64 > self.segments.capacity() {
            return Err(JournalError::invalid_argument(format!(
                "record of {} bytes exceeds the segment size of {} bytes",
                bytes.len(),
                self.segments.capacity()
            )));
        }
        Ok(bytes)
    }

    /// Appends encoded bytes to the current segment, rotating first when
    /// they do not fit. Any error here is an I/O failure.
    pub(crate) fn write_encoded(
        &mut self,
        bytes: &[u8],
        stats: &JournalStats,
    ) -> JournalResult<Location> {
        let len = bytes.len() as u64;
        let size = self.current.size()?;
        if size > 0 && size + len > self.segments.capacity() {
            self.rotate(stats)?;
        }

        let offset = self.current.append(bytes, self.sync_on_write)?;
        let location = Location::new(self.current.id(), offset, len as u32);
        self.segments.record_append(location.segment, len);
        Ok(location)
    }

    fn rotate(&mut self, stats: &JournalStats) -> JournalResult<()> {
        let sealed = self.current.id();
        self.current.sync()?;
        self.current = self.segments.allocate_segment()?;
        stats.record_rotation();
        debug!(sealed = %sealed, segment = %self.current.id(), "segment rotated");
        self.reclaim();
        Ok(())
    }

    /// Deletes dead segments; failures are logged and retried later.
    pub(crate) fn reclaim(&mut self) {
        if let Err(err) = self.segments.reclaim() {
            warn!(error = %err, "segment reclaim failed");
        }
        if self.control_pending && !self.segments.has_deferred() {
            match self.segments.factory().delete(CONTROL_FILE) {
                Ok(()) => self.control_pending = false,
                Err(err) => warn!(error = %err, "could not remove compaction control file"),
            }
        }
    }

    /// Updates the live index and accounting for a written record.
    pub(crate) fn apply(&mut self, record: &JournalRecord, location: Location) {
        match record {
            JournalRecord::Operation { op, record } => match record.tx_id {
                None => match op {
                    OpKind::Add | OpKind::Update => {
                        self.segments
                            .add_live(location.segment, u64::from(location.len));
                        self.replace(
                            record.id,
                            LiveEntry {
                                location,
                                user_type: record.user_type,
                            },
                        );
                    }
                    OpKind::Delete => self.remove(record.id),
                },
                Some(tx_id) => {
                    self.segments
                        .add_live(location.segment, u64::from(location.len));
                    self.pending.entry(tx_id).or_default().ops.push(PendingOp {
                        op: *op,
                        id: record.id,
                        user_type: record.user_type,
                        location,
                    });
                }
            },
            JournalRecord::Prepare { tx_id, .. } => {
                self.segments
                    .add_live(location.segment, u64::from(location.len));
                self.pending.entry(*tx_id).or_default().prepare = Some(location);
            }
            JournalRecord::Commit { tx_id } => {
                if let Some(tx) = self.pending.remove(tx_id) {
                    self.commit_pending(tx);
                }
            }
            JournalRecord::Rollback { tx_id } => {
                if let Some(tx) = self.pending.remove(tx_id) {
                    for dead in tx.locations() {
                        self.release(dead);
                    }
                }
            }
        }
    }

    fn commit_pending(&mut self, tx: PendingTx) {
        for op in &tx.ops {
            match op.op {
                OpKind::Add | OpKind::Update => self.replace(
                    op.id,
                    LiveEntry {
                        location: op.location,
                        user_type: op.user_type,
                    },
                ),
                OpKind::Delete => {
                    self.remove(op.id);
                    self.release(op.location);
                }
            }
        }
        if let Some(prepare) = tx.prepare {
            self.release(prepare);
        }
    }

    fn replace(&mut self, id: u64, entry: LiveEntry) {
        if let Some(old) = self.live.insert(id, entry) {
            self.release(old.location);
        }
    }

    fn remove(&mut self, id: u64) {
        if let Some(old) = self.live.remove(&id) {
            self.release(old.location);
        }
    }

    fn release(&mut self, location: Location) {
        self.segments
            .release(location.segment, u64::from(location.len));
    }

    /// Total bytes held live by current records and pending transactions.
    pub(crate) fn live_bytes(&self) -> u64 {
        self.segments.live_bytes()
    }
}
