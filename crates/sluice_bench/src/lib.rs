//! Benchmark utilities.

use rand::Rng;
use sluice_journal::{CompactionPolicy, JournalConfig, Record};

/// Generate random payload bytes of the specified size.
pub fn random_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate records with sequential ids and random payloads.
pub fn generate_records(count: usize, payload_size: usize) -> Vec<Record> {
    let mut rng = rand::thread_rng();
    (0..count as u64)
        .map(|id| Record::new(id, rng.gen_range(0..4), random_payload(payload_size)))
        .collect()
}

/// A journal configuration without fsync or background compaction.
pub fn bench_config(segment_size: u64) -> JournalConfig {
    JournalConfig::new()
        .segment_size(segment_size)
        .min_segments(0)
        .sync_on_write(false)
        .compaction(CompactionPolicy::disabled())
}
