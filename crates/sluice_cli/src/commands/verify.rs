//! Verify command implementation.

use super::{read_only_files, JournalArgs};
use sluice_journal::inspect::{open_segments, read_segment_file, JournalReader};
use sluice_journal::SegmentId;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Segments checked.
    pub segments_checked: usize,
    /// Valid records found.
    pub valid_records: u64,
    /// Damage at the end of the last written segment. The next load drops
    /// it.
    pub torn_tail: Option<(SegmentId, u64, String)>,
    /// Damage anywhere else. The journal will refuse to load.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Default)]
struct FirstDamage(Option<(u64, String)>);

impl JournalReader for FirstDamage {
    fn on_damaged(&mut self, _segment: SegmentId, offset: u64, reason: &str) {
        self.0 = Some((offset, reason.to_string()));
    }
}

/// Runs the verify command.
pub fn run(path: &Path, args: &JournalArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying journal at {:?}", path);
    println!();

    let result = verify(path, args)?;
    println!("Segments checked: {}", result.segments_checked);
    println!("Valid records:    {}", result.valid_records);
    if let Some((segment, offset, reason)) = &result.torn_tail {
        println!("Torn tail in segment {segment} at offset {offset} ({reason}); dropped on next load");
    }
    for error in &result.errors {
        println!("  ✗ {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
        Ok(())
    } else {
        println!("✗ Journal verification failed");
        Err("Verification failed".into())
    }
}

fn verify(path: &Path, args: &JournalArgs) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let segments = open_segments(read_only_files(path)?, &args.config())?;
    let last_written = segments
        .iter()
        .rposition(|segment| segment.size().map_or(false, |size| size > 0));

    let mut result = VerifyResult::default();
    for (index, segment) in segments.iter().enumerate() {
        let mut damage = FirstDamage::default();
        result.valid_records += read_segment_file(segment, &mut damage)?;
        result.segments_checked += 1;

        let Some((offset, reason)) = damage.0 else {
            continue;
        };
        if Some(index) == last_written && result.torn_tail.is_none() {
            result.torn_tail = Some((segment.id(), offset, reason));
        } else {
            result
                .errors
                .push(format!("segment {} offset {offset}: {reason}", segment.id()));
        }
    }
    Ok(result)
}
