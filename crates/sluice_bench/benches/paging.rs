//! Paging store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sluice_bench::random_payload;
use sluice_paging::{AddressSettings, PagingStore};
use sluice_storage::InMemoryFactory;
use std::sync::Arc;

fn memory_store() -> PagingStore {
    let settings = AddressSettings::new()
        .page_size_bytes(1024 * 1024)
        .max_size_bytes(1024);
    PagingStore::open("bench", Arc::new(InMemoryFactory::new()), settings)
        .unwrap()
        .sync_on_write(false)
}

/// Benchmark writing messages to pages.
fn bench_page(c: &mut Criterion) {
    let mut group = c.benchmark_group("page");

    for size in [64, 1024, 16384].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let store = memory_store();
            let message = random_payload(size);

            b.iter(|| {
                let position = store.page(black_box(&message)).unwrap();
                black_box(position);
            });
        });
    }

    group.finish();
}

/// Benchmark paging 1000 messages and reading them back with acks.
fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_depage_ack");
    group.sample_size(20);
    let message = random_payload(256);

    group.bench_function("1000x256b", |b| {
        b.iter(|| {
            let store = memory_store();
            for _ in 0..1000 {
                store.page(&message).unwrap();
            }
            while let Some(depaged) = store.depage().unwrap() {
                store.ack(depaged.position).unwrap();
            }
            black_box(store.is_paging());
        });
    });

    group.finish();
}

/// Benchmark routing on an unlimited address, the common fast path.
fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");
    let settings = AddressSettings::new().max_size_bytes(-1);
    let store = PagingStore::open("bench", Arc::new(InMemoryFactory::new()), settings).unwrap();
    let message = random_payload(128);

    group.bench_function("in_memory", |b| {
        b.iter(|| {
            let outcome = store.route(black_box(&message)).unwrap();
            store.add_size(-(message.len() as i64));
            black_box(outcome);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_page, bench_round_trip, bench_route);

criterion_main!(benches);
