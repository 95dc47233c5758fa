//! Paging stores across restarts and failures.

use proptest::prelude::*;
use sluice_paging::{AddressSettings, PagingError, PagingStore, RouteOutcome};
use sluice_storage::InMemoryFactory;
use sluice_testkit::prelude::*;
use std::sync::Arc;

fn small_pages(page_size: u64) -> AddressSettings {
    AddressSettings::new()
        .page_size_bytes(page_size)
        .max_size_bytes(1000)
        .hysteresis_bytes(100)
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn depage_order_is_send_order(
        messages in prop::collection::vec(message_strategy(), 1..100),
        page_size in 32u64..512,
    ) {
        let factory = InMemoryFactory::new();
        let store = PagingStore::open("q", Arc::new(factory.clone()), small_pages(page_size))
            .unwrap()
            .sync_on_write(false);
        for message in &messages {
            store.page(message).unwrap();
        }
        drop(store);

        // read back through a reopened store so page scanning is covered too
        let store = PagingStore::open("q", Arc::new(factory), small_pages(page_size)).unwrap();
        prop_assert!(store.is_paging());
        let mut depaged = Vec::new();
        while let Some(message) = store.depage().unwrap() {
            depaged.push(message.payload.to_vec());
        }
        prop_assert_eq!(depaged, messages);
        prop_assert!(!store.is_paging());
    }
}

#[test]
fn unacked_messages_are_redelivered_after_restart() {
    let paging = TestPaging::new(small_pages(64));
    let store = paging.store("orders").unwrap();
    let sent: Vec<Vec<u8>> = (0..30u8).map(|i| vec![i; 6]).collect();
    for message in &sent {
        store.page(message).unwrap();
    }
    for _ in 0..10 {
        let message = store.depage().unwrap().unwrap();
        store.ack(message.position).unwrap();
    }
    drop(store);

    let paging = paging.restart();
    let store = paging.get("orders").unwrap();
    let mut redelivered = Vec::new();
    while let Some(message) = store.depage().unwrap() {
        redelivered.push(message.payload.to_vec());
    }

    // at-least-once: a suffix of what was sent that holds everything unacked
    assert!(redelivered.len() >= 20);
    assert_eq!(redelivered[..], sent[sent.len() - redelivered.len()..]);
}

#[test]
fn hysteresis_through_the_manager() {
    let paging = TestPaging::new(small_pages(1024));
    let store = paging.store("jobs").unwrap();
    store.add_size(1050);
    assert!(paging.is_paging("jobs"));
    store.add_size(-51);
    assert!(paging.is_paging("jobs"));
    store.add_size(-99);
    assert!(paging.is_paging("jobs"));
    store.add_size(-1);
    assert!(!paging.is_paging("jobs"));
    assert_eq!(store.route(b"fits").unwrap(), RouteOutcome::InMemory);
}

#[test]
fn page_write_failure_stops_the_store() {
    let factory = Arc::new(CrashableFactory::new());
    let store = PagingStore::open("q", factory.clone(), small_pages(1024))
        .unwrap()
        .sync_on_write(false);
    store.page(&[1; 8]).unwrap();

    factory.switch().crash_after(4);
    assert!(matches!(
        store.page(&[2; 8]),
        Err(PagingError::IoFailure { .. })
    ));
    assert!(store.is_failed());
    factory.switch().reset();
    assert!(matches!(
        store.page(&[3; 8]),
        Err(PagingError::IoFailure { .. })
    ));
    drop(store);

    // the torn second message is cut off on reopen
    let store = PagingStore::open("q", Arc::new(factory.survivor()), small_pages(1024)).unwrap();
    assert_eq!(store.paged_messages(), 1);
    assert_eq!(&store.depage().unwrap().unwrap().payload[..], &[1; 8]);
}

#[test]
fn status_serializes() {
    let paging = TestPaging::new(small_pages(64));
    paging.store("a").unwrap().page(b"hello").unwrap();
    paging.store("b").unwrap();

    let value = serde_json::to_value(paging.status()).unwrap();
    assert_eq!(value[0]["address"], "a");
    assert_eq!(value[0]["paging"], true);
    assert_eq!(value[0]["paged_messages"], 1);
    assert_eq!(value[0]["paged_bytes"], 5);
    assert_eq!(value[1]["paging"], false);
}
