//! Streaming record iterator over one segment.
//!
//! Reads records one by one with a bounded buffer, so replaying or
//! compacting a large segment never loads it whole.

use crate::error::{JournalError, JournalResult};
use crate::record::{declared_len, decode_envelope, DecodeError, JournalRecord, HEADER_SIZE};
use crate::segment::file::SegmentFile;
use crate::types::{Location, SegmentId};
use std::sync::Arc;

/// Read buffer size for streaming iteration.
const READ_BUFFER_SIZE: usize = 64 * 1024; // 64 KB

/// A record read from a segment, with its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord {
    /// Where the record lives.
    pub location: Location,
    /// The decoded record.
    pub record: JournalRecord,
}

/// Why a scan stopped.
#[derive(Debug)]
pub(crate) enum ScanError {
    /// The bytes at `offset` are not a valid record.
    Decode { offset: u64, error: DecodeError },
    /// Reading failed.
    Journal(JournalError),
}

impl From<JournalError> for ScanError {
    fn from(err: JournalError) -> Self {
        Self::Journal(err)
    }
}

impl ScanError {
    pub(crate) fn into_error(self, segment: SegmentId) -> JournalError {
        match self {
            Self::Decode { offset, error } => JournalError::corruption(segment, offset, error.reason()),
            Self::Journal(err) => err,
        }
    }
}

/// A streaming iterator over the records of a segment.
///
/// The iterator holds the segment's `Arc`, which keeps a reclaimed segment
/// from being deleted until the iterator is dropped. It stops at the size
/// the segment had when the iterator was created.
///
/// Any damaged record, including a truncated final record, ends the
/// iteration with [`JournalError::JournalCorruption`]; the journal's
/// recovery decides separately whether a damaged tail is tolerable.
pub struct SegmentRecords {
    segment: Arc<SegmentFile>,
    end: u64,
    offset: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
    finished: bool,
}

impl SegmentRecords {
    pub(crate) fn new(segment: Arc<SegmentFile>) -> JournalResult<Self> {
        let end = segment.size()?;
        Ok(Self {
            segment,
            end,
            offset: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            finished: false,
        })
    }

    /// Returns the segment being read.
    #[must_use]
    pub fn segment(&self) -> &Arc<SegmentFile> {
        &self.segment
    }

    /// Returns the offset of the next record.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the size the iteration is bounded by.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Returns up to `len` bytes starting at the current offset, reading
    /// more from the segment when the buffer does not cover them.
    fn window(&mut self, len: usize) -> JournalResult<&[u8]> {
        let available = (self.end - self.offset) as usize;
        let want = len.min(available);
        let buffered_end = self.buffer_start + self.buffer.len() as u64;

        if self.offset < self.buffer_start || self.offset + want as u64 > buffered_end {
            let read_len = want.max(READ_BUFFER_SIZE).min(available);
            self.buffer = self.segment.read_at(self.offset, read_len)?;
            self.buffer_start = self.offset;
        }

        let start = (self.offset - self.buffer_start) as usize;
        Ok(&self.buffer[start..start + want])
    }

    pub(crate) fn next_raw(&mut self) -> Result<Option<ScannedRecord>, ScanError> {
        if self.finished || self.offset >= self.end {
            self.finished = true;
            return Ok(None);
        }

        let offset = self.offset;
        let total = match declared_len(self.window(HEADER_SIZE)?) {
            Ok(total) => total,
            Err(error) => {
                self.finished = true;
                return Err(ScanError::Decode { offset, error });
            }
        };

        let decoded = decode_envelope(self.window(total)?);
        match decoded {
            Ok((record, used)) => {
                self.offset += used as u64;
                // Fits: a record longer than u32 could not have been encoded.
                let location = Location::new(self.segment.id(), offset, used as u32);
                Ok(Some(ScannedRecord { location, record }))
            }
            Err(error) => {
                self.finished = true;
                Err(ScanError::Decode { offset, error })
            }
        }
    }
}

impl Iterator for SegmentRecords {
    type Item = JournalResult<ScannedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let segment = self.segment.id();
        self.next_raw()
            .map_err(|err| err.into_error(segment))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OpKind, Record};
    use sluice_storage::InMemoryBackend;

    fn segment_with(records: &[JournalRecord]) -> Arc<SegmentFile> {
        let segment = Arc::new(SegmentFile::new(
            SegmentId(1),
            "seg".to_string(),
            Box::new(InMemoryBackend::new()),
        ));
        for record in records {
            segment.append(&record.encode().unwrap(), false).unwrap();
        }
        segment
    }

    fn add(id: u64, payload: &[u8]) -> JournalRecord {
        JournalRecord::Operation {
            op: OpKind::Add,
            record: Record::new(id, 1, payload.to_vec()),
        }
    }

    #[test]
    fn iterates_in_order_with_locations() {
        let records = vec![add(1, b"a"), add(2, b"bb"), add(3, b"ccc")];
        let segment = segment_with(&records);

        let scanned: Vec<_> = segment.records().unwrap().map(Result::unwrap).collect();
        assert_eq!(scanned.len(), 3);
        assert_eq!(scanned[0].location.offset, 0);
        assert_eq!(
            scanned[1].location.offset,
            u64::from(scanned[0].location.len)
        );
        let decoded: Vec<_> = scanned.into_iter().map(|s| s.record).collect();
        assert_eq!(decoded, records);
    }

    #[test]
    fn records_larger_than_buffer() {
        let big = vec![7u8; READ_BUFFER_SIZE * 2 + 13];
        let segment = segment_with(&[add(1, b"x"), add(2, &big), add(3, b"y")]);
        let ids: Vec<_> = segment
            .records()
            .unwrap()
            .map(|r| r.unwrap().record.record_id().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn truncated_tail_reports_offset() {
        let segment = segment_with(&[add(1, b"a"), add(2, b"b")]);
        let size = segment.size().unwrap();
        segment.truncate(size - 3).unwrap();

        let mut records = segment.records().unwrap();
        assert!(records.next().unwrap().is_ok());
        let second_offset = records.offset();
        match records.next_raw() {
            Err(ScanError::Decode {
                offset,
                error: DecodeError::Truncated { .. },
            }) => assert_eq!(offset, second_offset),
            other => panic!("unexpected {other:?}"),
        }
        assert!(records.next().is_none());
    }

    #[test]
    fn empty_segment_yields_nothing() {
        let segment = segment_with(&[]);
        assert_eq!(segment.records().unwrap().count(), 0);
    }
}
