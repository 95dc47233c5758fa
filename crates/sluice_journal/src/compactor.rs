//! Journal compaction.
//!
//! A run rewrites the segments whose live share fell below
//! `candidate_occupancy` into fewer, denser ones holding only what is
//! still needed: the current version of each live record and the records
//! of unresolved transactions.
//!
//! ## Sources
//!
//! Sources are the oldest run of candidates, starting at the oldest
//! segment and ending before the first segment that is not a candidate.
//! Delete markers inside the run only ever target records inside it, so
//! they can be dropped. A pending transaction with records on both sides
//! of the run's end shortens the run to before its first record, keeping
//! the order of its operations intact.
//!
//! ## Phases
//!
//! 1. **Plan** (writer lock): the pre-allocated pool is discarded, one
//!    output id is reserved per non-empty source and a fresh writable
//!    segment is allocated after the reservation. The locations worth
//!    keeping are snapshotted.
//! 2. **Rewrite** (no lock): sources are scanned in order and kept records
//!    are written to `.cmp` files under the reserved ids. Appends continue
//!    in the new writable segment meanwhile.
//! 3. **Control** (writer lock): a control file naming the replaced
//!    segments and the outputs is written. Failing here aborts the run like
//!    a failed rewrite.
//! 4. **Publish** (writer lock): outputs are renamed into place, the
//!    in-memory index is remapped, the sources are retired and the control
//!    file removed. A failure here stops the journal.
//!
//! Outputs sort before the new writable segment, so anything appended
//! during the run replays after them. Segments left between the sources
//! and the outputs never touch a record the outputs carry. A crash before
//! the control file exists leaves only `.cmp` files, which recovery
//! deletes. A crash after it is rolled forward by recovery.
//!
//! Committed records are rewritten without their transaction id; records
//! of pending transactions are copied as they are, so a later commit or
//! rollback still applies to them.

use crate::error::{JournalError, JournalResult};
use crate::journal::{ActiveJournal, ControlFile, Journal, CONTROL_FILE};
use crate::record::{JournalRecord, OpKind};
use crate::segment::{SegmentFile, SegmentInfo, SegmentNaming};
use crate::types::{Location, SegmentId};
use serde::Serialize;
use sluice_storage::FileFactory;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// The outcome of a compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Segments removed by the run.
    pub replaced_segments: Vec<SegmentId>,
    /// Segments written by the run.
    pub output_segments: Vec<SegmentId>,
    /// Records copied into the outputs.
    pub records_moved: u64,
    /// Total size of the replaced segments.
    pub bytes_before: u64,
    /// Total size of the outputs.
    pub bytes_after: u64,
}

impl CompactionReport {
    /// Bytes freed by the run.
    #[must_use]
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keep {
    /// Current version of a record: rewritten as a plain add.
    Live,
    /// Part of an unresolved transaction: copied unchanged.
    Pending,
}

struct CompactionPlan {
    sources: Vec<Arc<SegmentFile>>,
    keep: HashMap<Location, Keep>,
    first_output: SegmentId,
    reserved: u64,
    capacity: u64,
    naming: SegmentNaming,
    factory: Arc<dyn FileFactory>,
}

struct Output {
    file: SegmentFile,
    size: u64,
}

struct Rewritten {
    outputs: Vec<Output>,
    relocated: HashMap<Location, Location>,
    records_moved: u64,
    bytes_before: u64,
}

/// Clears the in-progress flag when a run ends.
struct CompactionGuard<'a>(&'a AtomicBool);

impl<'a> CompactionGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> JournalResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| JournalError::CompactionInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one compaction pass over a loaded journal.
pub(crate) fn run(journal: &Journal) -> JournalResult<CompactionReport> {
    let shared = &journal.shared;
    let _guard = CompactionGuard::acquire(&shared.compacting)?;

    let candidate_occupancy = journal.config().compaction.candidate_occupancy;
    let plan = {
        let mut state = journal.lock_state();
        let active = state.active_mut()?;
        match make_plan(active, candidate_occupancy) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                // nothing to rewrite, but held segments may have been released
                active.reclaim();
                return Ok(CompactionReport::default());
            }
            Err(err) => {
                shared.stats.record_compaction_failure();
                return Err(JournalError::compaction_failed(err.to_string()));
            }
        }
    };
    debug!(
        sources = plan.sources.len(),
        keep = plan.keep.len(),
        first_output = %plan.first_output,
        "compaction planned"
    );

    let rewritten = match rewrite(&plan) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            discard_outputs(&plan);
            shared.stats.record_compaction_failure();
            warn!(error = %err, "compaction aborted");
            return Err(JournalError::compaction_failed(err.to_string()));
        }
    };

    let mut state = journal.lock_state();
    let active = match state.active_mut() {
        Ok(active) => active,
        Err(err) => {
            discard_outputs(&plan);
            shared.stats.record_compaction_failure();
            return Err(err);
        }
    };
    if let Err(err) = write_control(active, &plan, &rewritten) {
        shared.stats.record_compaction_failure();
        if let Err(restore) = restore_control(active, &plan) {
            // a control file naming the outputs may survive a crash
            shared.stats.record_error();
            return Err(state.fail(&restore));
        }
        discard_outputs(&plan);
        warn!(error = %err, "compaction aborted, control file not written");
        return Err(JournalError::compaction_failed(err.to_string()));
    }
    match publish(active, plan, rewritten) {
        Ok(report) => {
            shared.stats.record_compaction(report.bytes_reclaimed());
            info!(
                replaced = report.replaced_segments.len(),
                outputs = report.output_segments.len(),
                records = report.records_moved,
                reclaimed = report.bytes_reclaimed(),
                "compaction published"
            );
            Ok(report)
        }
        Err(err) => {
            shared.stats.record_compaction_failure();
            shared.stats.record_error();
            Err(state.fail(&err))
        }
    }
}

fn make_plan(
    active: &mut ActiveJournal,
    candidate_occupancy: u32,
) -> JournalResult<Option<CompactionPlan>> {
    let infos = active.segments.infos();
    let Some(last) = source_end(active, &infos, candidate_occupancy) else {
        return Ok(None);
    };
    let reserved = infos
        .iter()
        .filter(|info| info.id <= last && info.size > 0)
        .count() as u64;
    if reserved == 0 {
        return Ok(None);
    }

    active.segments.discard_pool()?;
    let first_output = active.segments.reserve_ids(reserved);
    active.current.sync()?;
    active.current = active.segments.allocate_segment()?;

    let sources: Vec<Arc<SegmentFile>> = active
        .segments
        .files()
        .into_iter()
        .filter(|file| file.id() <= last)
        .collect();

    let mut keep = HashMap::new();
    for entry in active.live.values() {
        if entry.location.segment <= last {
            keep.insert(entry.location, Keep::Live);
        }
    }
    for tx in active.pending.values() {
        for location in tx.locations() {
            if location.segment <= last {
                keep.insert(location, Keep::Pending);
            }
        }
    }

    Ok(Some(CompactionPlan {
        sources,
        keep,
        first_output,
        reserved,
        capacity: active.segments.capacity(),
        naming: active.segments.naming().clone(),
        factory: Arc::clone(active.segments.factory()),
    }))
}

/// Picks the last segment of the source run, if there is one.
fn source_end(
    active: &ActiveJournal,
    infos: &[SegmentInfo],
    candidate_occupancy: u32,
) -> Option<SegmentId> {
    let run: Vec<SegmentId> = infos
        .iter()
        .take_while(|info| info.size == 0 || info.is_candidate(candidate_occupancy))
        .map(|info| info.id)
        .collect();
    let mut last = *run.last()?;

    loop {
        let straddling = active
            .pending
            .values()
            .filter_map(|tx| {
                let first = tx.locations().map(|l| l.segment).min()?;
                let newest = tx.locations().map(|l| l.segment).max()?;
                (first <= last && newest > last).then_some(first)
            })
            .min();
        let Some(first) = straddling else {
            return Some(last);
        };
        last = run.iter().copied().filter(|id| *id < first).max()?;
    }
}

fn rewrite(plan: &CompactionPlan) -> JournalResult<Rewritten> {
    let mut outputs: Vec<Output> = Vec::new();
    let mut relocated = HashMap::with_capacity(plan.keep.len());
    let mut records_moved = 0;

    for source in &plan.sources {
        for scanned in source.records()? {
            let scanned = scanned?;
            let Some(keep) = plan.keep.get(&scanned.location) else {
                continue;
            };
            let record = match (*keep, scanned.record) {
                (Keep::Live, JournalRecord::Operation { mut record, .. }) => {
                    record.tx_id = None;
                    JournalRecord::Operation {
                        op: OpKind::Add,
                        record,
                    }
                }
                (_, record) => record,
            };
            let bytes = record.encode()?;
            let len = bytes.len() as u64;

            let needs_new = outputs
                .last()
                .map_or(true, |out| out.size > 0 && out.size + len > plan.capacity);
            if needs_new {
                if outputs.len() as u64 == plan.reserved {
                    return Err(JournalError::compaction_failed(
                        "outputs exceed the reserved segment ids",
                    ));
                }
                let id = SegmentId(plan.first_output.as_u64() + outputs.len() as u64);
                let name = plan.naming.compacting_name(id);
                let backend = plan.factory.open(&name)?;
                outputs.push(Output {
                    file: SegmentFile::new(id, name, backend),
                    size: 0,
                });
            }

            let Some(out) = outputs.last_mut() else {
                continue;
            };
            let offset = out.file.append(&bytes, false)?;
            out.size += len;
            relocated.insert(
                scanned.location,
                Location::new(out.file.id(), offset, len as u32),
            );
            records_moved += 1;
        }
    }

    for out in &outputs {
        out.file.sync()?;
    }
    let bytes_before = plan
        .sources
        .iter()
        .map(|s| s.size())
        .sum::<JournalResult<u64>>()?;
    Ok(Rewritten {
        outputs,
        relocated,
        records_moved,
        bytes_before,
    })
}

fn publish(
    active: &mut ActiveJournal,
    plan: CompactionPlan,
    rewritten: Rewritten,
) -> JournalResult<CompactionReport> {
    let mut replaced: Vec<SegmentId> = plan.sources.iter().map(|s| s.id()).collect();
    drop(plan.sources);
    let output_ids: Vec<SegmentId> = rewritten.outputs.iter().map(|o| o.file.id()).collect();

    let mut bytes_after = 0;
    for out in rewritten.outputs {
        let id = out.file.id();
        let pending = out.file.name().to_string();
        drop(out.file);
        let name = plan.naming.file_name(id);
        plan.factory.rename(&pending, &name)?;
        let backend = plan.factory.open(&name)?;
        active
            .segments
            .install(Arc::new(SegmentFile::new(id, name, backend)), out.size);
        bytes_after += out.size;
    }
    plan.factory.sync_dir()?;

    let relocated = &rewritten.relocated;
    let mut moved_live = Vec::new();
    for entry in active.live.values_mut() {
        if let Some(to) = relocated.get(&entry.location) {
            entry.location = *to;
            moved_live.push(*to);
        }
    }
    for tx in active.pending.values_mut() {
        for op in &mut tx.ops {
            if let Some(to) = relocated.get(&op.location) {
                op.location = *to;
                moved_live.push(*to);
            }
        }
        if let Some(prepare) = tx.prepare.as_mut() {
            if let Some(to) = relocated.get(prepare) {
                *prepare = *to;
                moved_live.push(*to);
            }
        }
    }
    for location in moved_live {
        active
            .segments
            .add_live(location.segment, u64::from(location.len));
    }

    let deferred = active.segments.retire(&replaced)?;
    active.segments.settle_states();
    if deferred == 0 && !active.segments.has_deferred() {
        plan.factory.delete(CONTROL_FILE)?;
        active.control_pending = false;
    } else {
        debug!(deferred, "replaced segments still referenced, control file kept");
        active.control_pending = true;
    }
    active.reclaim();

    replaced.sort();
    Ok(CompactionReport {
        replaced_segments: replaced,
        output_segments: output_ids,
        records_moved: rewritten.records_moved,
        bytes_before: rewritten.bytes_before,
        bytes_after,
    })
}

/// Writes the control file that lets recovery roll the publish forward.
///
/// Segments whose deletion is still deferred are named as replaced too, so
/// a crash does not leave them behind.
fn write_control(
    active: &ActiveJournal,
    plan: &CompactionPlan,
    rewritten: &Rewritten,
) -> JournalResult<()> {
    let mut replaced: Vec<SegmentId> = plan.sources.iter().map(|s| s.id()).collect();
    replaced.extend(active.segments.deferred_ids());
    let control = ControlFile {
        replaced,
        outputs: rewritten.outputs.iter().map(|o| o.file.id()).collect(),
    };
    control.write(plan.factory.as_ref())
}

/// Undoes a control file write that reported failure.
///
/// The file may have reached the disk anyway, and must not name outputs
/// that are about to be discarded.
fn restore_control(active: &ActiveJournal, plan: &CompactionPlan) -> JournalResult<()> {
    if active.control_pending {
        let control = ControlFile {
            replaced: active.segments.deferred_ids(),
            outputs: Vec::new(),
        };
        return control.write(plan.factory.as_ref());
    }
    if plan.factory.exists(CONTROL_FILE) {
        plan.factory.delete(CONTROL_FILE)?;
    }
    Ok(())
}

/// Deletes the `.cmp` files of an aborted run.
fn discard_outputs(plan: &CompactionPlan) {
    for index in 0..plan.reserved {
        let id = SegmentId(plan.first_output.as_u64() + index);
        let name = plan.naming.compacting_name(id);
        if plan.factory.exists(&name) {
            if let Err(err) = plan.factory.delete(&name) {
                warn!(file = %name, error = %err, "could not remove compaction output");
            }
        }
    }
}

/// Handle to the background compactor thread.
///
/// The thread wakes every `check_interval`, asks the compaction policy
/// whether a run is due and runs it. It stops when the handle is stopped
/// or dropped.
pub struct CompactorHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CompactorHandle {
    pub(crate) fn spawn(journal: Journal) -> JournalResult<Self> {
        let interval = journal.config().compaction.check_interval;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("sluice-compactor".into())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "compactor started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if journal.is_failed() {
                        warn!("journal failed, compactor stopping");
                        break;
                    }
                    if !journal.needs_compaction() {
                        continue;
                    }
                    match journal.compact() {
                        Ok(_) | Err(JournalError::CompactionInProgress) => {}
                        Err(err) => warn!(error = %err, "background compaction failed"),
                    }
                }
                debug!("compactor stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stops the thread and waits for it to finish.
    ///
    /// A run in progress completes first.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("compactor thread panicked");
            }
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CompactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactorHandle")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionPolicy, JournalConfig};
    use crate::types::TransactionId;
    use sluice_storage::InMemoryFactory;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    // any segment holding a dead byte is a candidate
    fn config() -> JournalConfig {
        JournalConfig::new()
            .segment_size(256)
            .min_segments(0)
            .sync_on_write(false)
            .compaction(CompactionPolicy::disabled().candidate_occupancy(100))
    }

    fn open(factory: &Arc<InMemoryFactory>) -> Journal {
        let journal = Journal::with_factory(factory.clone(), config()).unwrap();
        journal.load().unwrap();
        journal
    }

    fn live_set(factory: &Arc<InMemoryFactory>) -> BTreeMap<u64, Vec<u8>> {
        let journal = Journal::with_factory(factory.clone(), config()).unwrap();
        journal
            .load()
            .unwrap()
            .records
            .into_iter()
            .map(|r| (r.id, r.payload))
            .collect()
    }

    fn leftovers(factory: &InMemoryFactory) -> Vec<String> {
        factory
            .file_names()
            .into_iter()
            .filter(|name| name == CONTROL_FILE || name.ends_with(".cmp"))
            .collect()
    }

    #[test]
    fn compaction_preserves_the_live_set() {
        let factory = Arc::new(InMemoryFactory::new());
        let journal = open(&factory);
        for round in 0..5u8 {
            for id in 0..10 {
                journal.update(id, 1, vec![round; 10]).unwrap();
            }
        }
        journal.delete(3).unwrap();
        let live_before = journal.live_bytes();

        let report = journal.compact().unwrap();
        assert_eq!(report.records_moved, 9);
        assert!(report.bytes_after < report.bytes_before);
        assert!(journal.live_bytes() <= live_before);
        assert_eq!(journal.segments().iter().map(|s| s.dead_bytes).sum::<u64>(), 0);
        assert!(leftovers(&factory).is_empty());
        assert!(!journal.needs_compaction());
        assert_eq!(journal.stats().compactions, 1);
        drop(journal);

        let live = live_set(&factory);
        let expected: BTreeMap<u64, Vec<u8>> = (0..10)
            .filter(|id| *id != 3)
            .map(|id| (id, vec![4; 10]))
            .collect();
        assert_eq!(live, expected);
    }

    #[test]
    fn empty_journal_compacts_to_nothing() {
        let journal = open(&Arc::new(InMemoryFactory::new()));
        assert_eq!(journal.compact().unwrap(), CompactionReport::default());
    }

    #[test]
    fn committed_records_lose_their_transaction() {
        let factory = Arc::new(InMemoryFactory::new());
        let journal = open(&factory);
        let tx = TransactionId::new(4);
        journal.add_tx(tx, 1, 0, vec![1; 8]).unwrap();
        journal.prepare(tx, Vec::new()).unwrap();
        journal.commit(tx).unwrap();

        journal.compact().unwrap();
        let census = crate::inspect::count_records(factory.clone(), &config()).unwrap();
        assert_eq!(census.records, 1);
        assert_eq!(census.by_tag.get("add"), Some(&1));
        drop(journal);
        assert_eq!(live_set(&factory).get(&1), Some(&vec![1; 8]));
    }

    #[test]
    fn pending_transactions_survive_compaction() {
        let factory = Arc::new(InMemoryFactory::new());
        let journal = open(&factory);
        let prepared = TransactionId::new(5);
        let open_tx = TransactionId::new(6);

        journal.add(1, 0, vec![1]).unwrap();
        journal.add_tx(prepared, 2, 0, vec![2]).unwrap();
        journal.prepare(prepared, b"xid".to_vec()).unwrap();
        journal.add_tx(open_tx, 3, 0, vec![3]).unwrap();
        for i in 0..20u8 {
            journal.update(10, 0, vec![i; 10]).unwrap();
        }

        journal.compact().unwrap();
        journal.prepare(open_tx, Vec::new()).unwrap();
        journal.commit(open_tx).unwrap();
        drop(journal);

        let journal = Journal::with_factory(factory.clone(), config()).unwrap();
        let loaded = journal.load().unwrap();
        let in_doubt = loaded.in_doubt(prepared).unwrap();
        assert_eq!(in_doubt.records[0].id, 2);
        assert_eq!(in_doubt.data, b"xid".to_vec());

        journal.commit(prepared).unwrap();
        drop(journal);
        let live = live_set(&factory);
        assert_eq!(live.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 10]);
        assert_eq!(live[&10], vec![19; 10]);
    }

    #[test]
    fn appends_continue_during_compaction() {
        let factory = Arc::new(InMemoryFactory::new());
        let journal = open(&factory);
        for id in 0..30u64 {
            journal.add(id, 0, vec![id as u8]).unwrap();
        }

        let writer = {
            let journal = journal.clone();
            thread::spawn(move || {
                for i in 0..200u64 {
                    journal.update(i % 25, 0, i.to_le_bytes().to_vec()).unwrap();
                }
            })
        };
        for _ in 0..5 {
            journal.compact().unwrap();
        }
        writer.join().unwrap();
        journal.compact().unwrap();
        drop(journal);

        let mut expected: BTreeMap<u64, Vec<u8>> = (25..30).map(|id| (id, vec![id as u8])).collect();
        for id in 0..25u64 {
            expected.insert(id, (175 + id).to_le_bytes().to_vec());
        }
        assert_eq!(live_set(&factory), expected);
        assert!(leftovers(&factory).is_empty());
    }

    #[test]
    fn live_segment_ends_the_source_run() {
        let factory = Arc::new(InMemoryFactory::new());
        let journal = open(&factory);
        // 38-byte records, six per segment
        for id in 1..=12 {
            journal.add(id, 0, vec![0; 10]).unwrap();
        }
        journal.update(1, 0, vec![1; 10]).unwrap();
        for id in 13..=17 {
            journal.add(id, 0, vec![0; 10]).unwrap();
        }
        journal.update(13, 0, vec![1; 10]).unwrap();

        let report = journal.compact().unwrap();
        assert_eq!(report.replaced_segments, vec![SegmentId(1)]);
        assert_eq!(report.output_segments, vec![SegmentId(5)]);
        assert_eq!(report.records_moved, 5);

        let segments = journal.segments();
        let ids: Vec<u64> = segments.iter().map(|s| s.id.as_u64()).collect();
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        assert_eq!((segments[0].size, segments[0].dead_bytes), (228, 0));
        assert_eq!(segments[1].dead_bytes, 38);
        drop(journal);

        let live = live_set(&factory);
        assert_eq!(live.len(), 17);
        assert_eq!(live[&1], vec![1; 10]);
        assert_eq!(live[&13], vec![1; 10]);
    }

    #[test]
    fn fully_live_head_leaves_nothing_to_rewrite() {
        let factory = Arc::new(InMemoryFactory::new());
        let journal = open(&factory);
        for id in 1..=12 {
            journal.add(id, 0, vec![0; 10]).unwrap();
        }
        for id in 7..=12 {
            journal.delete(id).unwrap();
        }
        let before = journal.segments();

        assert_eq!(journal.compact().unwrap(), CompactionReport::default());
        assert_eq!(journal.segments(), before);
        assert!(leftovers(&factory).is_empty());
    }

    #[test]
    fn source_run_stops_before_a_straddling_transaction() {
        let factory = Arc::new(InMemoryFactory::new());
        let journal = open(&factory);
        let tx = TransactionId::new(9);
        for id in 100..=105 {
            journal.add(id, 0, vec![0; 10]).unwrap();
        }
        journal.update(100, 0, vec![1; 10]).unwrap();
        journal.add_tx(tx, 50, 0, vec![5; 10]).unwrap();
        for id in 1..=4 {
            journal.add(id, 0, vec![0; 10]).unwrap();
        }
        // rotates: the delete of 50 lands one segment after its add
        journal.update(1, 0, vec![1; 10]).unwrap();
        journal.delete_tx(tx, 50).unwrap();

        let report = journal.compact().unwrap();
        assert_eq!(report.replaced_segments, vec![SegmentId(1)]);
        assert_eq!(report.output_segments, vec![SegmentId(4)]);

        journal.prepare(tx, Vec::new()).unwrap();
        journal.commit(tx).unwrap();
        drop(journal);

        let live = live_set(&factory);
        assert!(!live.contains_key(&50));
        let ids: Vec<u64> = live.keys().copied().collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 100, 101, 102, 103, 104, 105]);
        assert_eq!(live[&100], vec![1; 10]);
    }

    #[test]
    fn only_one_run_at_a_time() {
        let flag = AtomicBool::new(false);
        let guard = CompactionGuard::acquire(&flag).unwrap();
        assert!(matches!(
            CompactionGuard::acquire(&flag),
            Err(JournalError::CompactionInProgress)
        ));
        drop(guard);
        CompactionGuard::acquire(&flag).unwrap();
    }

    #[test]
    fn held_segments_are_deleted_later() {
        let factory = Arc::new(InMemoryFactory::new());
        let journal = open(&factory);
        for id in 1..=12 {
            journal.add(id, 0, vec![0; 10]).unwrap();
        }
        journal.update(1, 0, vec![1; 10]).unwrap();
        let first = journal.segments()[0].name.clone();

        let reader = journal.read_segment(SegmentId(1)).unwrap();
        journal.compact().unwrap();
        assert!(journal.segments().iter().all(|s| s.id != SegmentId(1)));
        let files = factory.file_names();
        assert!(files.contains(&first));
        assert!(files.contains(&CONTROL_FILE.to_string()));

        assert_eq!(reader.count(), 6);
        journal.compact().unwrap();
        let files = factory.file_names();
        assert!(!files.contains(&first));
        assert!(leftovers(&factory).is_empty());
        drop(journal);

        let live = live_set(&factory);
        assert_eq!(live.len(), 12);
        assert_eq!(live[&1], vec![1; 10]);
    }

    #[test]
    fn background_compactor_runs_when_due() {
        let factory = Arc::new(InMemoryFactory::new());
        let policy = CompactionPolicy::disabled()
            .compact_percentage(20)
            .candidate_occupancy(100)
            .check_interval(Duration::from_millis(10));
        let journal = Journal::with_factory(factory.clone(), config().compaction(policy)).unwrap();
        journal.load().unwrap();
        for id in 0..6 {
            journal.add(id, 0, vec![0; 10]).unwrap();
        }
        for id in 0..3 {
            journal.update(id, 0, vec![1; 10]).unwrap();
        }
        assert!(journal.needs_compaction());

        let handle = journal.spawn_compactor().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while journal.stats().compactions == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();

        assert!(journal.stats().compactions >= 1);
        assert!(!journal.needs_compaction());
    }
}
