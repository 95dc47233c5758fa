//! Compact command implementation.

use super::JournalArgs;
use serde::Serialize;
use sluice_journal::{CompactionReport, Journal, SegmentInfo};
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize)]
struct DryRun {
    needs_compaction: bool,
    live_bytes: u64,
    segments: Vec<SegmentInfo>,
}

/// Runs the compact command.
///
/// Loads the journal, which takes its lock, then compacts it once. With
/// `dry_run` only the segment table is shown.
pub fn run(
    path: &Path,
    args: &JournalArgs,
    dry_run: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("{} is not a directory", path.display()).into());
    }
    let journal = Journal::open(path, args.config())?;
    journal.load()?;

    if dry_run {
        let plan = DryRun {
            needs_compaction: journal.needs_compaction(),
            live_bytes: journal.live_bytes(),
            segments: journal.segments(),
        };
        match format {
            "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
            _ => print_plan(&plan),
        }
        return Ok(());
    }

    let report = journal.compact()?;
    info!(
        replaced = report.replaced_segments.len(),
        reclaimed = report.bytes_reclaimed(),
        "compaction finished"
    );
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_report(&report),
    }
    Ok(())
}

fn print_plan(plan: &DryRun) {
    println!(
        "{:<8} {:<24} {:<12} {:>10} {:>10} {:>10}",
        "ID", "NAME", "STATE", "SIZE", "LIVE", "DEAD"
    );
    for segment in &plan.segments {
        println!(
            "{:<8} {:<24} {:<12} {:>10} {:>10} {:>10}",
            segment.id.as_u64(),
            segment.name,
            format!("{:?}", segment.state).to_lowercase(),
            segment.size,
            segment.live_bytes,
            segment.dead_bytes
        );
    }
    println!();
    println!("Live bytes: {}", plan.live_bytes);
    if plan.needs_compaction {
        println!("Compaction would run");
    } else {
        println!("Compaction thresholds not reached");
    }
}

fn print_report(report: &CompactionReport) {
    if report.replaced_segments.is_empty() {
        println!("Nothing to compact");
        return;
    }
    println!("Replaced segments: {:?}", ids(&report.replaced_segments));
    println!("Output segments:   {:?}", ids(&report.output_segments));
    println!("Records moved:     {}", report.records_moved);
    println!(
        "Bytes:             {} -> {} ({} reclaimed)",
        report.bytes_before,
        report.bytes_after,
        report.bytes_reclaimed()
    );
}

fn ids(segments: &[sluice_journal::SegmentId]) -> Vec<u64> {
    segments.iter().map(|id| id.as_u64()).collect()
}
