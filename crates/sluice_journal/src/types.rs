//! Identifier types shared across the journal.

use serde::Serialize;
use std::fmt;

/// Identifier of a transaction.
///
/// Chosen by the caller. An id may be reused once its previous
/// transaction has been committed or rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for TransactionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Sequence number of a segment file.
///
/// Segment ids are strictly increasing and never reused; ascending id
/// order is replay order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Creates a new segment ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next segment ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// Position of an encoded record inside the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    /// Segment holding the record.
    pub segment: SegmentId,
    /// Byte offset of the record envelope.
    pub offset: u64,
    /// Encoded length including envelope.
    pub len: u32,
}

impl Location {
    /// Creates a new location.
    #[must_use]
    pub const fn new(segment: SegmentId, offset: u64, len: u32) -> Self {
        Self {
            segment,
            offset,
            len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_display() {
        assert_eq!(TransactionId::new(7).to_string(), "tx:7");
        assert_eq!(TransactionId::from(7), TransactionId(7));
    }

    #[test]
    fn segment_id_ordering() {
        let a = SegmentId::new(1);
        assert!(a < a.next());
        assert_eq!(a.next().as_u64(), 2);
    }

    #[test]
    fn locations_sort_by_segment_then_offset() {
        let early = Location::new(SegmentId(1), 500, 20);
        let late = Location::new(SegmentId(2), 0, 20);
        assert!(early < late);
    }
}
