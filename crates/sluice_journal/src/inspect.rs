//! Offline journal inspection.
//!
//! These functions read segment files without loading a journal: nothing
//! is truncated, rolled forward or appended. They back the operator CLI.

use crate::config::JournalConfig;
use crate::error::JournalResult;
use crate::record::{JournalRecord, OpKind, Record, RecordTag};
use crate::segment::{ScanError, SegmentFile, SegmentManager};
use crate::types::{Location, SegmentId, TransactionId};
use serde::Serialize;
use sluice_storage::FileFactory;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Callbacks for each record kind found while reading a segment.
///
/// Every method has an empty default, so a reader only implements what it
/// needs.
#[allow(unused_variables)]
pub trait JournalReader {
    /// A non-transactional add.
    fn on_add(&mut self, location: Location, record: &Record) {}
    /// A non-transactional update.
    fn on_update(&mut self, location: Location, record: &Record) {}
    /// A non-transactional delete.
    fn on_delete(&mut self, location: Location, id: u64) {}
    /// An add inside a transaction.
    fn on_add_tx(&mut self, location: Location, tx_id: TransactionId, record: &Record) {}
    /// An update inside a transaction.
    fn on_update_tx(&mut self, location: Location, tx_id: TransactionId, record: &Record) {}
    /// A delete inside a transaction.
    fn on_delete_tx(&mut self, location: Location, tx_id: TransactionId, id: u64) {}
    /// A prepare marker.
    fn on_prepare(&mut self, location: Location, tx_id: TransactionId, data: &[u8]) {}
    /// A commit marker.
    fn on_commit(&mut self, location: Location, tx_id: TransactionId) {}
    /// A rollback marker.
    fn on_rollback(&mut self, location: Location, tx_id: TransactionId) {}
    /// Bytes at `offset` are not a valid record; reading the segment stops.
    fn on_damaged(&mut self, segment: SegmentId, offset: u64, reason: &str) {}
}

/// Opens every segment of a journal for reading.
///
/// # Errors
///
/// Returns an error if the segment files cannot be listed or opened.
pub fn open_segments(
    factory: Arc<dyn FileFactory>,
    config: &JournalConfig,
) -> JournalResult<Vec<Arc<SegmentFile>>> {
    Ok(SegmentManager::open(factory, config)?.files())
}

/// Feeds every record of a segment to `reader`, in file order.
///
/// Damage is reported through [`JournalReader::on_damaged`] and ends the
/// segment; it is not an error. Returns the number of valid records.
///
/// # Errors
///
/// Returns an error only if reading the file fails.
pub fn read_segment_file(
    segment: &Arc<SegmentFile>,
    reader: &mut dyn JournalReader,
) -> JournalResult<u64> {
    let mut records = segment.records()?;
    let mut count = 0;
    loop {
        match records.next_raw() {
            Ok(Some(scanned)) => {
                dispatch(reader, scanned.location, &scanned.record);
                count += 1;
            }
            Ok(None) => return Ok(count),
            Err(ScanError::Decode { offset, error }) => {
                reader.on_damaged(segment.id(), offset, &error.reason());
                return Ok(count);
            }
            Err(err @ ScanError::Journal(_)) => return Err(err.into_error(segment.id())),
        }
    }
}

fn dispatch(reader: &mut dyn JournalReader, location: Location, record: &JournalRecord) {
    match record {
        JournalRecord::Operation { op, record } => match (op, record.tx_id) {
            (OpKind::Add, None) => reader.on_add(location, record),
            (OpKind::Update, None) => reader.on_update(location, record),
            (OpKind::Delete, None) => reader.on_delete(location, record.id),
            (OpKind::Add, Some(tx)) => reader.on_add_tx(location, tx, record),
            (OpKind::Update, Some(tx)) => reader.on_update_tx(location, tx, record),
            (OpKind::Delete, Some(tx)) => reader.on_delete_tx(location, tx, record.id),
        },
        JournalRecord::Prepare { tx_id, data } => reader.on_prepare(location, *tx_id, data),
        JournalRecord::Commit { tx_id } => reader.on_commit(location, *tx_id),
        JournalRecord::Rollback { tx_id } => reader.on_rollback(location, *tx_id),
    }
}

/// A damaged record found by a census.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DamagedRecord {
    /// Segment holding the damage.
    pub segment: SegmentId,
    /// Offset of the first invalid byte.
    pub offset: u64,
    /// What was wrong.
    pub reason: String,
}

/// Counts of every record in a journal, live or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordCensus {
    /// Segments read.
    pub segments: usize,
    /// Valid records read.
    pub records: u64,
    /// Encoded bytes of the valid records.
    pub bytes: u64,
    /// Records per kind, keyed by tag name.
    pub by_tag: BTreeMap<&'static str, u64>,
    /// Operation records per user type.
    pub by_user_type: BTreeMap<u8, u64>,
    /// Damage found, at most one per segment.
    pub damaged: Vec<DamagedRecord>,
}

impl RecordCensus {
    fn count(&mut self, tag: RecordTag, location: Location) {
        self.records += 1;
        self.bytes += u64::from(location.len);
        *self.by_tag.entry(tag.name()).or_insert(0) += 1;
    }

    fn count_operation(&mut self, tag: RecordTag, location: Location, user_type: u8) {
        self.count(tag, location);
        *self.by_user_type.entry(user_type).or_insert(0) += 1;
    }
}

impl JournalReader for RecordCensus {
    fn on_add(&mut self, location: Location, record: &Record) {
        self.count_operation(RecordTag::Add, location, record.user_type);
    }

    fn on_update(&mut self, location: Location, record: &Record) {
        self.count_operation(RecordTag::Update, location, record.user_type);
    }

    fn on_delete(&mut self, location: Location, _id: u64) {
        self.count(RecordTag::Delete, location);
    }

    fn on_add_tx(&mut self, location: Location, _tx_id: TransactionId, record: &Record) {
        self.count_operation(RecordTag::AddTx, location, record.user_type);
    }

    fn on_update_tx(&mut self, location: Location, _tx_id: TransactionId, record: &Record) {
        self.count_operation(RecordTag::UpdateTx, location, record.user_type);
    }

    fn on_delete_tx(&mut self, location: Location, _tx_id: TransactionId, _id: u64) {
        self.count(RecordTag::DeleteTx, location);
    }

    fn on_prepare(&mut self, location: Location, _tx_id: TransactionId, _data: &[u8]) {
        self.count(RecordTag::Prepare, location);
    }

    fn on_commit(&mut self, location: Location, _tx_id: TransactionId) {
        self.count(RecordTag::Commit, location);
    }

    fn on_rollback(&mut self, location: Location, _tx_id: TransactionId) {
        self.count(RecordTag::Rollback, location);
    }

    fn on_damaged(&mut self, segment: SegmentId, offset: u64, reason: &str) {
        self.damaged.push(DamagedRecord {
            segment,
            offset,
            reason: reason.to_string(),
        });
    }
}

/// Counts every record in a journal directory, live or superseded.
///
/// # Errors
///
/// Returns an error if a segment cannot be opened or read.
pub fn count_records(
    factory: Arc<dyn FileFactory>,
    config: &JournalConfig,
) -> JournalResult<RecordCensus> {
    let mut census = RecordCensus::default();
    for segment in open_segments(factory, config)? {
        read_segment_file(&segment, &mut census)?;
        census.segments += 1;
    }
    Ok(census)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use sluice_storage::InMemoryFactory;

    #[derive(Default)]
    struct Trace(Vec<String>);

    impl JournalReader for Trace {
        fn on_add(&mut self, _: Location, record: &Record) {
            self.0.push(format!("add {}", record.id));
        }
        fn on_delete(&mut self, _: Location, id: u64) {
            self.0.push(format!("delete {id}"));
        }
        fn on_add_tx(&mut self, _: Location, tx_id: TransactionId, record: &Record) {
            self.0.push(format!("add {} in {tx_id}", record.id));
        }
        fn on_prepare(&mut self, _: Location, tx_id: TransactionId, data: &[u8]) {
            self.0.push(format!("prepare {tx_id} {}", data.len()));
        }
        fn on_commit(&mut self, _: Location, tx_id: TransactionId) {
            self.0.push(format!("commit {tx_id}"));
        }
        fn on_damaged(&mut self, _: SegmentId, offset: u64, _: &str) {
            self.0.push(format!("damaged at {offset}"));
        }
    }

    fn populated() -> (Arc<InMemoryFactory>, JournalConfig) {
        let factory = Arc::new(InMemoryFactory::new());
        let config = JournalConfig::new().min_segments(0);
        let journal = Journal::with_factory(factory.clone(), config.clone()).unwrap();
        journal.load().unwrap();
        journal.add(1, 3, b"one".to_vec()).unwrap();
        journal.add(2, 3, b"two".to_vec()).unwrap();
        journal.delete(1).unwrap();
        let tx = TransactionId::new(9);
        journal.add_tx(tx, 3, 4, b"three".to_vec()).unwrap();
        journal.prepare(tx, b"xid".to_vec()).unwrap();
        journal.commit(tx).unwrap();
        (factory, config)
    }

    #[test]
    fn visitor_sees_records_in_order() {
        let (factory, config) = populated();
        let segments = open_segments(factory, &config).unwrap();
        let mut trace = Trace::default();
        let mut total = 0;
        for segment in &segments {
            total += read_segment_file(segment, &mut trace).unwrap();
        }
        assert_eq!(total, 6);
        assert_eq!(
            trace.0,
            vec![
                "add 1",
                "add 2",
                "delete 1",
                "add 3 in tx:9",
                "prepare tx:9 3",
                "commit tx:9"
            ]
        );
    }

    #[test]
    fn census_counts_everything() {
        let (factory, config) = populated();
        let census = count_records(factory, &config).unwrap();
        assert_eq!(census.records, 6);
        assert_eq!(census.by_tag.get("add"), Some(&2));
        assert_eq!(census.by_tag.get("delete"), Some(&1));
        assert_eq!(census.by_tag.get("add-tx"), Some(&1));
        assert_eq!(census.by_user_type.get(&3), Some(&2));
        assert_eq!(census.by_user_type.get(&4), Some(&1));
        assert!(census.damaged.is_empty());
    }

    #[test]
    fn damage_is_reported_not_fatal() {
        let (factory, config) = populated();
        let name = factory
            .file_names()
            .into_iter()
            .find(|name| name.ends_with(".jrn"))
            .unwrap();
        let mut data = factory.file_data(&name).unwrap();
        let len = data.len();
        data.truncate(len - 3);
        factory.set_file_data(&name, data);

        let mut trace = Trace::default();
        let segments = open_segments(factory, &config).unwrap();
        read_segment_file(&segments[0], &mut trace).unwrap();
        assert_eq!(trace.0.len(), 6);
        assert!(trace.0[5].starts_with("damaged at"));
    }
}
