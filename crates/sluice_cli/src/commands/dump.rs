//! Dump command implementation.

use super::{read_only_files, JournalArgs};
use serde::Serialize;
use sluice_journal::inspect::{open_segments, read_segment_file, JournalReader};
use sluice_journal::{Location, Record, SegmentId, TransactionId};
use std::path::Path;

/// One record as printed.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Segment holding the record.
    pub segment: u64,
    /// Offset within the segment.
    pub offset: u64,
    /// Encoded length.
    pub len: u32,
    /// Record kind.
    pub kind: &'static str,
    /// Record id (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// User type (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_type: Option<u8>,
    /// Transaction id (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<u64>,
    /// Payload or prepare data size (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
    /// Why the bytes could not be read (damaged entries only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damage: Option<String>,
}

impl RecordInfo {
    fn at(location: Location, kind: &'static str) -> Self {
        Self {
            segment: location.segment.as_u64(),
            offset: location.offset,
            len: location.len,
            kind,
            id: None,
            user_type: None,
            tx_id: None,
            payload_size: None,
            damage: None,
        }
    }

    fn with_record(mut self, record: &Record) -> Self {
        self.id = Some(record.id);
        self.user_type = Some(record.user_type);
        self.payload_size = Some(record.payload.len());
        self
    }

    fn with_tx(mut self, tx_id: TransactionId) -> Self {
        self.tx_id = Some(tx_id.as_u64());
        self
    }
}

/// Collects records up to a limit.
struct Collector {
    records: Vec<RecordInfo>,
    limit: usize,
}

impl Collector {
    fn push(&mut self, info: RecordInfo) {
        if self.records.len() < self.limit {
            self.records.push(info);
        }
    }

    fn is_full(&self) -> bool {
        self.records.len() >= self.limit
    }
}

impl JournalReader for Collector {
    fn on_add(&mut self, location: Location, record: &Record) {
        self.push(RecordInfo::at(location, "add").with_record(record));
    }

    fn on_update(&mut self, location: Location, record: &Record) {
        self.push(RecordInfo::at(location, "update").with_record(record));
    }

    fn on_delete(&mut self, location: Location, id: u64) {
        let mut info = RecordInfo::at(location, "delete");
        info.id = Some(id);
        self.push(info);
    }

    fn on_add_tx(&mut self, location: Location, tx_id: TransactionId, record: &Record) {
        self.push(RecordInfo::at(location, "add-tx").with_record(record).with_tx(tx_id));
    }

    fn on_update_tx(&mut self, location: Location, tx_id: TransactionId, record: &Record) {
        self.push(
            RecordInfo::at(location, "update-tx")
                .with_record(record)
                .with_tx(tx_id),
        );
    }

    fn on_delete_tx(&mut self, location: Location, tx_id: TransactionId, id: u64) {
        let mut info = RecordInfo::at(location, "delete-tx").with_tx(tx_id);
        info.id = Some(id);
        self.push(info);
    }

    fn on_prepare(&mut self, location: Location, tx_id: TransactionId, data: &[u8]) {
        let mut info = RecordInfo::at(location, "prepare").with_tx(tx_id);
        info.payload_size = Some(data.len());
        self.push(info);
    }

    fn on_commit(&mut self, location: Location, tx_id: TransactionId) {
        self.push(RecordInfo::at(location, "commit").with_tx(tx_id));
    }

    fn on_rollback(&mut self, location: Location, tx_id: TransactionId) {
        self.push(RecordInfo::at(location, "rollback").with_tx(tx_id));
    }

    fn on_damaged(&mut self, segment: SegmentId, offset: u64, reason: &str) {
        let mut info = RecordInfo::at(Location::new(segment, offset, 0), "damaged");
        info.damage = Some(reason.to_string());
        self.push(info);
    }
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    args: &JournalArgs,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = collect(path, args, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

fn collect(
    path: &Path,
    args: &JournalArgs,
    limit: Option<usize>,
) -> Result<Vec<RecordInfo>, Box<dyn std::error::Error>> {
    let factory = read_only_files(path)?;
    let mut collector = Collector {
        records: Vec::new(),
        limit: limit.unwrap_or(usize::MAX),
    };
    for segment in open_segments(factory, &args.config())? {
        if collector.is_full() {
            break;
        }
        read_segment_file(&segment, &mut collector)?;
    }
    Ok(collector.records)
}

fn print_text_output(records: &[RecordInfo]) {
    println!("{:>8} {:>10} {:>6}  {:<10} DETAILS", "SEGMENT", "OFFSET", "LEN", "KIND");
    for record in records {
        let mut details = Vec::new();
        if let Some(id) = record.id {
            details.push(format!("id={id}"));
        }
        if let Some(user_type) = record.user_type {
            details.push(format!("type={user_type}"));
        }
        if let Some(tx_id) = record.tx_id {
            details.push(format!("tx={tx_id}"));
        }
        if let Some(size) = record.payload_size {
            details.push(format!("size={size}"));
        }
        if let Some(damage) = &record.damage {
            details.push(damage.clone());
        }
        println!(
            "{:>8} {:>10} {:>6}  {:<10} {}",
            record.segment,
            record.offset,
            record.len,
            record.kind,
            details.join(" ")
        );
    }
    println!();
    println!("{} records", records.len());
}
