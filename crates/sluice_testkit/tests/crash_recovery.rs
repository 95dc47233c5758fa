//! Recovery after simulated crashes.

use proptest::prelude::*;
use sluice_journal::{Journal, JournalError, SegmentId};
use sluice_storage::FileFactory;
use sluice_testkit::prelude::*;
use std::sync::Arc;

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn accepted_records_survive_a_crash(
        ops in op_sequence_strategy(1, 60),
        budget in 0u64..4000,
    ) {
        let config = small_config();
        let factory = Arc::new(CrashableFactory::new());
        let journal = Journal::with_factory(factory.clone(), config.clone()).unwrap();
        journal.load().unwrap();

        factory.switch().crash_after(budget);
        let mut model = ReferenceModel::new();
        if drive_all(&journal, &mut model, &ops).is_err() {
            prop_assert!(journal.is_failed());
        }
        drop(journal);

        let loaded = reload(Arc::new(factory.survivor()), &config);
        prop_assert_eq!(&live_values(&loaded), model.live());
        prop_assert_eq!(&in_doubt_ids(&loaded), model.in_doubt());
    }

    #[test]
    fn replay_is_idempotent(ops in op_sequence_strategy(1, 60)) {
        let journal = TestJournal::memory();
        let mut model = ReferenceModel::new();
        drive_all(&journal, &mut model, &ops).unwrap();

        let first = journal.restart();
        let second = first.restart();
        prop_assert_eq!(&live_values(&second.loaded), model.live());
        prop_assert_eq!(&in_doubt_ids(&second.loaded), model.in_doubt());
        prop_assert!(second.loaded.discarded.is_empty());
        prop_assert!(second.loaded.truncated_at.is_none());
    }
}

#[test]
fn trailing_partial_record_is_dropped() {
    let journal = TestJournal::memory();
    for id in 0..5 {
        journal.add(id, 1, vec![id as u8; 10]).unwrap();
    }
    let factory = journal.factory().clone();
    drop(journal);

    let name = last_written_file(&factory, "jrn").unwrap();
    truncate_tail(&factory, &name, 3);

    let journal = TestJournal::over(factory, small_config());
    assert_eq!(journal.loaded.records.len(), 4);
    assert_eq!(journal.loaded.truncated_at, Some((SegmentId::new(1), 152)));
    assert!(journal.loaded.get(4).is_none());

    // the cut-off record can be written again
    journal.add(4, 1, vec![4; 10]).unwrap();
    let journal = journal.restart();
    assert_eq!(journal.loaded.records.len(), 5);
}

#[test]
fn held_segment_keeps_its_delete_markers_on_disk() {
    // 128-byte records, two per segment
    let config = small_config().segment_size(256);
    let journal = TestJournal::with_config(config.clone());
    journal.add(1, 0, vec![1; 100]).unwrap();
    journal.add(2, 0, vec![2; 100]).unwrap();
    let reader = journal.read_segment(SegmentId::new(1)).unwrap();

    journal.delete(1).unwrap();
    journal.delete(2).unwrap();
    journal.add(3, 0, vec![3; 100]).unwrap();
    journal.add(4, 0, vec![4; 100]).unwrap();
    journal.delete(3).unwrap();
    journal.add(5, 0, vec![5; 100]).unwrap();

    // segment 2 holds the delete markers for segment 1
    let on_disk = journal.factory().list("jrn").unwrap();
    assert_eq!(on_disk.len(), 4);

    // crash while the reader is still open
    let factory = journal.factory().clone();
    drop(journal);
    let loaded = reload(Arc::new(factory), &config);
    let ids: Vec<u64> = loaded.records.iter().map(|record| record.id).collect();
    assert_eq!(ids, vec![4, 5]);
    assert_eq!(reader.count(), 2);
}

#[test]
fn write_failure_stops_the_journal() {
    let factory = Arc::new(CrashableFactory::new());
    let journal = Journal::with_factory(factory.clone(), small_config()).unwrap();
    journal.load().unwrap();
    journal.add(1, 0, b"kept".to_vec()).unwrap();

    factory.switch().crash_after(5);
    assert!(matches!(
        journal.add(2, 0, b"torn".to_vec()),
        Err(JournalError::IoFailure { .. })
    ));
    assert!(journal.is_failed());

    // later calls fail even once the disk is back
    factory.switch().reset();
    assert!(matches!(
        journal.add(3, 0, b"refused".to_vec()),
        Err(JournalError::IoFailure { .. })
    ));
    assert!(journal.stats().errors >= 1);
    drop(journal);

    let loaded = reload(Arc::new(factory.survivor()), &small_config());
    assert_eq!(loaded.records.len(), 1);
    assert_eq!(loaded.records[0].payload, b"kept");
}

#[test]
fn failed_sync_stops_the_journal() {
    let factory = Arc::new(CrashableFactory::new());
    let config = small_config().sync_on_write(true);
    let journal = Journal::with_factory(factory.clone(), config).unwrap();
    journal.load().unwrap();

    factory.switch().set_fail_sync(true);
    assert!(journal.add(1, 0, b"x".to_vec()).is_err());
    assert!(journal.is_failed());
}

#[test]
fn prepared_transaction_torn_commit_is_in_doubt() {
    use sluice_journal::TransactionId;

    let factory = Arc::new(CrashableFactory::new());
    let journal = Journal::with_factory(factory.clone(), small_config()).unwrap();
    journal.load().unwrap();
    let tx = TransactionId::new(7);
    journal.add_tx(tx, 1, 0, b"a".to_vec()).unwrap();
    journal.add_tx(tx, 2, 0, b"b".to_vec()).unwrap();
    journal.prepare(tx, b"xid-7".to_vec()).unwrap();

    factory.switch().crash_after(4);
    assert!(journal.commit(tx).is_err());
    drop(journal);

    let loaded = reload(Arc::new(factory.survivor()), &small_config());
    assert!(loaded.records.is_empty());
    let in_doubt = loaded.in_doubt(tx).unwrap();
    assert_eq!(in_doubt.data, b"xid-7");
    assert_eq!(in_doubt.records.len(), 2);
}
