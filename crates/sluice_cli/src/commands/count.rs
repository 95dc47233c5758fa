//! Count command implementation.

use super::{read_only_files, JournalArgs};
use serde::Serialize;
use sluice_journal::inspect::{count_records, RecordCensus};
use sluice_journal::Journal;
use std::collections::BTreeMap;
use std::path::Path;

/// Live record counts of a loaded journal.
#[derive(Debug, Serialize)]
pub struct LiveCount {
    /// Live records.
    pub records: usize,
    /// Live records per user type.
    pub by_user_type: BTreeMap<u8, usize>,
    /// Transactions prepared and not resolved.
    pub in_doubt: usize,
}

/// Runs the count command.
///
/// Without `live` every record on disk is counted and nothing is written.
/// With `live` the journal is loaded, which takes its lock and may drop a
/// torn final record.
pub fn run(
    path: &Path,
    args: &JournalArgs,
    live: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if live {
        let count = count_live(path, args)?;
        match format {
            "json" => println!("{}", serde_json::to_string_pretty(&count)?),
            _ => print_live(&count),
        }
    } else {
        let census = count_records(read_only_files(path)?, &args.config())?;
        match format {
            "json" => println!("{}", serde_json::to_string_pretty(&census)?),
            _ => print_census(&census),
        }
    }
    Ok(())
}

fn count_live(path: &Path, args: &JournalArgs) -> Result<LiveCount, Box<dyn std::error::Error>> {
    let journal = Journal::open(path, args.config())?;
    let loaded = journal.load()?;
    Ok(LiveCount {
        records: loaded.records.len(),
        by_user_type: loaded.count_by_user_type(),
        in_doubt: loaded.in_doubt.len(),
    })
}

fn print_census(census: &RecordCensus) {
    println!("Segments: {}", census.segments);
    println!("Records:  {} ({} bytes)", census.records, census.bytes);
    println!();
    println!("By kind:");
    for (tag, count) in &census.by_tag {
        println!("  {tag:<10} {count}");
    }
    println!();
    println!("By user type:");
    for (user_type, count) in &census.by_user_type {
        println!("  {user_type:<10} {count}");
    }
    if !census.damaged.is_empty() {
        println!();
        println!("Damaged:");
        for damage in &census.damaged {
            println!(
                "  segment {} offset {}: {}",
                damage.segment, damage.offset, damage.reason
            );
        }
    }
}

fn print_live(count: &LiveCount) {
    println!("Live records: {}", count.records);
    println!("In doubt:     {}", count.in_doubt);
    println!();
    println!("By user type:");
    for (user_type, records) in &count.by_user_type {
        println!("  {user_type:<10} {records}");
    }
}
