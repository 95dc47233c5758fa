//! Journal benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sluice_bench::{bench_config, generate_records, random_payload};
use sluice_journal::{Journal, TransactionId};
use sluice_storage::InMemoryFactory;
use std::sync::Arc;
use tempfile::TempDir;

fn memory_journal(segment_size: u64) -> Journal {
    let journal =
        Journal::with_factory(Arc::new(InMemoryFactory::new()), bench_config(segment_size))
            .unwrap();
    journal.load().unwrap();
    journal
}

/// Benchmark appending add records to an in-memory journal.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for size in [64, 1024, 16384].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let journal = memory_journal(10 * 1024 * 1024);
            let payload = random_payload(size);
            let mut id = 0u64;

            b.iter(|| {
                journal.add(black_box(id), 1, payload.clone()).unwrap();
                id += 1;
            });
        });
    }

    group.finish();
}

/// Benchmark appending to a journal on disk, without fsync.
fn bench_append_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_file");
    group.sample_size(50);

    let temp_dir = TempDir::new().unwrap();
    let journal = Journal::open(temp_dir.path(), bench_config(10 * 1024 * 1024)).unwrap();
    journal.load().unwrap();
    let payload = random_payload(256);
    let mut id = 0u64;

    group.bench_function("256b", |b| {
        b.iter(|| {
            journal.add(black_box(id), 1, payload.clone()).unwrap();
            id += 1;
        });
    });

    group.finish();
}

/// Benchmark a full transaction: three adds, prepare and commit.
fn bench_transaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");
    let journal = memory_journal(10 * 1024 * 1024);
    let payload = random_payload(128);
    let mut next = 0u64;

    group.bench_function("3_adds_prepare_commit", |b| {
        b.iter(|| {
            next += 1;
            let tx = TransactionId::new(next);
            for i in 0..3 {
                journal.add_tx(tx, next * 3 + i, 1, payload.clone()).unwrap();
            }
            journal.prepare(tx, Vec::new()).unwrap();
            journal.commit(tx).unwrap();
        });
    });

    group.finish();
}

/// Benchmark loading a journal with many records.
fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");
    group.sample_size(20);

    for count in [1000, 10000].iter() {
        let factory = Arc::new(InMemoryFactory::new());
        {
            let journal = Journal::with_factory(factory.clone(), bench_config(1024 * 1024)).unwrap();
            journal.load().unwrap();
            for record in generate_records(*count, 64) {
                journal.add(record.id, record.user_type, record.payload).unwrap();
            }
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let journal =
                    Journal::with_factory(factory.clone(), bench_config(1024 * 1024)).unwrap();
                black_box(journal.load().unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark compacting a journal where most records were deleted.
fn bench_compact(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact");
    group.sample_size(20);

    group.bench_function("1000_records_90pct_dead", |b| {
        b.iter(|| {
            let journal = memory_journal(64 * 1024);
            for record in generate_records(1000, 64) {
                journal.add(record.id, record.user_type, record.payload).unwrap();
            }
            for id in 0..900 {
                journal.delete(id).unwrap();
            }
            black_box(journal.compact().unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_append,
    bench_append_file,
    bench_transaction,
    bench_load,
    bench_compact,
);

criterion_main!(benches);
