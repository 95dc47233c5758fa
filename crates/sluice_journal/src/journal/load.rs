//! Journal recovery.
//!
//! Segments are replayed in ascending id order into a working map of
//! `record id -> latest record`. Transactional operations are buffered per
//! transaction until a commit applies them or a rollback discards them.
//!
//! ## Tolerated damage
//!
//! A truncated record, or a record whose checksum fails and which ends
//! exactly at the end of the file, is accepted only as the final record of
//! the last non-empty segment. So is a damaged record in that segment with
//! nothing decodable after it, such as a zero-filled tail. Either is the
//! trace of an append interrupted by a crash: the damaged bytes are dropped
//! and the segment truncated back to the last good record. Damage anywhere
//! else is [`JournalError::JournalCorruption`].
//!
//! ## Unresolved transactions
//!
//! - prepared: reported in-doubt and kept pending, to be resolved with
//!   `commit` or `rollback`
//! - never prepared: an incomplete write; discarded, and a rollback marker
//!   is appended so a later reuse of the id starts fresh

use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::journal::active::{ActiveJournal, LiveEntry, PendingOp, PendingTx};
use crate::journal::control;
use crate::record::{decode_envelope, DecodeError, JournalRecord, OpKind, Record, RECORD_MAGIC};
use crate::segment::{PublishedSegments, ScanError, SegmentFile, SegmentManager, SegmentNaming};
use crate::stats::JournalStats;
use crate::types::{Location, SegmentId, TransactionId};
use serde::Serialize;
use sluice_storage::FileFactory;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// A prepared transaction that was neither committed nor rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransaction {
    /// Transaction ID.
    pub tx_id: TransactionId,
    /// Data stored with the prepare marker.
    pub data: Vec<u8>,
    /// Records the transaction adds or updates, in operation order.
    pub records: Vec<Record>,
    /// Record ids the transaction deletes, in operation order.
    pub deletes: Vec<u64>,
}

/// The state recovered by `Journal::load`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedJournal {
    /// Committed live records in journal order.
    pub records: Vec<Record>,
    /// Prepared, unresolved transactions ordered by id.
    pub in_doubt: Vec<PreparedTransaction>,
    /// Transactions that were never prepared and have been discarded.
    pub discarded: Vec<TransactionId>,
    /// Where a damaged trailing record was cut off, if anywhere.
    pub truncated_at: Option<(SegmentId, u64)>,
    /// Counters describing the load.
    pub summary: LoadSummary,
}

impl LoadedJournal {
    /// Returns the live record with the given id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Counts live records per user record type.
    #[must_use]
    pub fn count_by_user_type(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.user_type).or_insert(0) += 1;
        }
        counts
    }

    /// Returns the in-doubt transaction with the given id.
    #[must_use]
    pub fn in_doubt(&self, tx_id: TransactionId) -> Option<&PreparedTransaction> {
        self.in_doubt.iter().find(|tx| tx.tx_id == tx_id)
    }
}

/// A summary of a load, for logging and tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    /// Segments scanned.
    pub segments: usize,
    /// Records decoded.
    pub records_read: u64,
    /// Live records recovered.
    pub live_records: usize,
    /// In-doubt transactions.
    pub in_doubt: usize,
}

#[derive(Debug, Default)]
struct RecoveringTx {
    ops: Vec<(OpKind, Record, Location)>,
    prepare: Option<(Vec<u8>, Location)>,
}

#[derive(Debug, Default)]
struct Replay {
    live: HashMap<u64, (Record, Location)>,
    pending: HashMap<TransactionId, RecoveringTx>,
    records_read: u64,
}

impl Replay {
    fn apply(&mut self, record: JournalRecord, location: Location) {
        self.records_read += 1;
        match record {
            JournalRecord::Operation { op, record } => match record.tx_id {
                None => self.apply_committed(op, record, location),
                Some(tx_id) => {
                    self.pending
                        .entry(tx_id)
                        .or_default()
                        .ops
                        .push((op, record, location));
                }
            },
            JournalRecord::Prepare { tx_id, data } => {
                self.pending.entry(tx_id).or_default().prepare = Some((data, location));
            }
            JournalRecord::Commit { tx_id } => {
                if let Some(tx) = self.pending.remove(&tx_id) {
                    for (op, record, location) in tx.ops {
                        self.apply_committed(op, record, location);
                    }
                }
            }
            JournalRecord::Rollback { tx_id } => {
                self.pending.remove(&tx_id);
            }
        }
    }

    fn apply_committed(&mut self, op: OpKind, mut record: Record, location: Location) {
        match op {
            OpKind::Add | OpKind::Update => {
                record.tx_id = None;
                self.live.insert(record.id, (record, location));
            }
            OpKind::Delete => {
                self.live.remove(&record.id);
            }
        }
    }
}

/// Replays every segment and returns the loaded writer state.
pub(crate) fn recover(
    factory: Arc<dyn FileFactory>,
    config: &JournalConfig,
    published: PublishedSegments,
    stats: &JournalStats,
) -> JournalResult<(ActiveJournal, LoadedJournal)> {
    control::recover(factory.as_ref(), &SegmentNaming::from_config(config))?;
    let mut segments = SegmentManager::open_with(factory, config, published)?;

    let files = segments.files();
    let mut sizes = Vec::with_capacity(files.len());
    for file in &files {
        sizes.push(file.size()?);
    }
    let last_non_empty = sizes.iter().rposition(|size| *size > 0);

    let mut replay = Replay::default();
    let mut truncated_at = None;
    for (index, file) in files.iter().enumerate() {
        let is_tail = Some(index) == last_non_empty;
        if let Some(cut) = replay_segment(file, sizes[index], is_tail, &mut replay)? {
            file.truncate(cut)?;
            segments.set_size(file.id(), cut);
            truncated_at = Some((file.id(), cut));
            warn!(segment = %file.id(), offset = cut, "dropped damaged trailing record");
        }
    }

    let tail_id = last_non_empty.map(|index| files[index].id());
    drop(files);
    segments.adopt_empty_tail(tail_id);
    let current = match tail_id {
        Some(id) => segments.resume(id)?,
        None => segments.allocate_segment()?,
    };

    let mut active = ActiveJournal {
        segments,
        current,
        live: HashMap::with_capacity(replay.live.len()),
        pending: HashMap::new(),
        sync_on_write: config.sync_on_write,
        control_pending: false,
    };
    active.segments.reset_live();

    let mut records: Vec<(Location, Record)> = Vec::with_capacity(replay.live.len());
    for (id, (record, location)) in replay.live {
        active
            .segments
            .add_live(location.segment, u64::from(location.len));
        active.live.insert(
            id,
            LiveEntry {
                location,
                user_type: record.user_type,
            },
        );
        records.push((location, record));
    }
    records.sort_by_key(|(location, _)| *location);

    let mut in_doubt = Vec::new();
    let mut discarded = Vec::new();
    for (tx_id, tx) in replay.pending {
        let Some((data, prepare)) = tx.prepare else {
            discarded.push(tx_id);
            continue;
        };

        let mut pending = PendingTx {
            ops: Vec::with_capacity(tx.ops.len()),
            prepare: Some(prepare),
        };
        let mut prepared = PreparedTransaction {
            tx_id,
            data,
            records: Vec::new(),
            deletes: Vec::new(),
        };
        for (op, record, location) in tx.ops {
            pending.ops.push(PendingOp {
                op,
                id: record.id,
                user_type: record.user_type,
                location,
            });
            match op {
                OpKind::Delete => prepared.deletes.push(record.id),
                OpKind::Add | OpKind::Update => prepared.records.push(record),
            }
        }
        for location in pending.locations() {
            active
                .segments
                .add_live(location.segment, u64::from(location.len));
        }
        active.pending.insert(tx_id, pending);
        in_doubt.push(prepared);
    }
    in_doubt.sort_by_key(|tx| tx.tx_id);
    discarded.sort();

    active.segments.settle_states();
    active.reclaim();

    for tx_id in &discarded {
        let marker = JournalRecord::Rollback { tx_id: *tx_id };
        let bytes = marker.encode()?;
        let location = active.write_encoded(&bytes, stats)?;
        active.apply(&marker, location);
        warn!(tx_id = %tx_id, "discarded incomplete transaction");
    }

    let summary = LoadSummary {
        segments: active.segments.infos().len(),
        records_read: replay.records_read,
        live_records: records.len(),
        in_doubt: in_doubt.len(),
    };
    info!(
        segments = summary.segments,
        records = summary.records_read,
        live = summary.live_records,
        in_doubt = summary.in_doubt,
        "journal loaded"
    );

    let loaded = LoadedJournal {
        records: records.into_iter().map(|(_, record)| record).collect(),
        in_doubt,
        discarded,
        truncated_at,
        summary,
    };
    Ok((active, loaded))
}

/// Replays one segment. Returns the offset to truncate to when the tail
/// record was damaged and may be dropped.
fn replay_segment(
    file: &Arc<SegmentFile>,
    size: u64,
    is_tail: bool,
    replay: &mut Replay,
) -> JournalResult<Option<u64>> {
    let mut records = file.records()?;
    loop {
        match records.next_raw() {
            Ok(Some(scanned)) => replay.apply(scanned.record, scanned.location),
            Ok(None) => return Ok(None),
            Err(ScanError::Decode { offset, error }) => {
                if !is_tail {
                    return Err(JournalError::corruption(file.id(), offset, error.reason()));
                }
                let torn = match &error {
                    DecodeError::Truncated { .. } => true,
                    DecodeError::Corrupt {
                        record_len: Some(len),
                        ..
                    } if offset + *len as u64 == size => true,
                    DecodeError::Corrupt { .. } => nothing_decodes_after(file, offset, size)?,
                };
                if torn {
                    return Ok(Some(offset));
                }
                return Err(JournalError::corruption(file.id(), offset, error.reason()));
            }
            Err(err @ ScanError::Journal(_)) => return Err(err.into_error(file.id())),
        }
    }
}

/// Returns whether no record starts anywhere past a damaged one at
/// `offset`. An append torn by a crash can leave zeros or garbage behind,
/// but never a valid record after it.
fn nothing_decodes_after(file: &SegmentFile, offset: u64, size: u64) -> JournalResult<bool> {
    let rest = file.read_at(offset, size.saturating_sub(offset) as usize)?;
    if rest.iter().all(|byte| *byte == 0) {
        return Ok(true);
    }
    let later = (1..rest.len()).any(|at| {
        rest[at..].starts_with(&RECORD_MAGIC) && decode_envelope(&rest[at..]).is_ok()
    });
    Ok(!later)
}
