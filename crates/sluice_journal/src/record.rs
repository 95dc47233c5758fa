//! Journal record types and the on-disk envelope.
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | tag (1) | length (4) | body (N) | crc32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers every byte before it.
//! The header and trailer have the same size for every record kind.

use crate::error::{JournalError, JournalResult};
use crate::types::TransactionId;

/// Magic bytes identifying a journal record.
pub const RECORD_MAGIC: [u8; 4] = *b"SLJR";

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

/// magic (4) + version (2) + tag (1) + length (4) = 11 bytes
pub const HEADER_SIZE: usize = 11;

/// CRC size.
pub const TRAILER_SIZE: usize = 4;

/// Smallest possible encoded record (a commit or rollback marker).
pub const MIN_RECORD_SIZE: usize = HEADER_SIZE + 8 + TRAILER_SIZE;

/// Tag byte of a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordTag {
    /// Non-transactional add.
    Add = 1,
    /// Non-transactional update.
    Update = 2,
    /// Non-transactional delete.
    Delete = 3,
    /// Transactional add.
    AddTx = 4,
    /// Transactional update.
    UpdateTx = 5,
    /// Transactional delete.
    DeleteTx = 6,
    /// Prepare marker.
    Prepare = 7,
    /// Commit marker.
    Commit = 8,
    /// Rollback marker.
    Rollback = 9,
}

impl RecordTag {
    /// All tags in byte order.
    pub const ALL: [Self; 9] = [
        Self::Add,
        Self::Update,
        Self::Delete,
        Self::AddTx,
        Self::UpdateTx,
        Self::DeleteTx,
        Self::Prepare,
        Self::Commit,
        Self::Rollback,
    ];

    /// Converts a byte to a record tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.get(usize::from(b).checked_sub(1)?).copied()
    }

    /// Converts the tag to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns a short lowercase name, as printed by tooling.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::AddTx => "add-tx",
            Self::UpdateTx => "update-tx",
            Self::DeleteTx => "delete-tx",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

/// Kind of a record operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Insert a new record id.
    Add,
    /// Supersede an existing record id.
    Update,
    /// Remove a record id.
    Delete,
}

/// A journaled record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record id, unique for the lifetime of the journal.
    pub id: u64,
    /// Caller-defined record type, opaque to the journal.
    pub user_type: u8,
    /// Record payload.
    pub payload: Vec<u8>,
    /// Owning transaction, if any.
    pub tx_id: Option<TransactionId>,
}

impl Record {
    /// Creates a non-transactional record.
    #[must_use]
    pub fn new(id: u64, user_type: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            user_type,
            payload: payload.into(),
            tx_id: None,
        }
    }

    /// Returns this record bound to a transaction.
    #[must_use]
    pub fn in_tx(mut self, tx_id: TransactionId) -> Self {
        self.tx_id = Some(tx_id);
        self
    }
}

/// Every kind of record the journal stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// A record operation; transactional when `record.tx_id` is set.
    Operation {
        /// What the operation does.
        op: OpKind,
        /// The record it applies to.
        record: Record,
    },

    /// Prepare marker carrying opaque coordinator data (an XID).
    Prepare {
        /// Transaction ID.
        tx_id: TransactionId,
        /// Opaque data stored with the prepare.
        data: Vec<u8>,
    },

    /// Commit marker.
    Commit {
        /// Transaction ID.
        tx_id: TransactionId,
    },

    /// Rollback marker.
    Rollback {
        /// Transaction ID.
        tx_id: TransactionId,
    },
}

impl JournalRecord {
    /// Maximum body size; the length field is 4 bytes.
    pub const MAX_BODY_SIZE: usize = u32::MAX as usize;

    /// Returns the record tag.
    #[must_use]
    pub fn tag(&self) -> RecordTag {
        match self {
            Self::Operation { op, record } => match (op, record.tx_id.is_some()) {
                (OpKind::Add, false) => RecordTag::Add,
                (OpKind::Update, false) => RecordTag::Update,
                (OpKind::Delete, false) => RecordTag::Delete,
                (OpKind::Add, true) => RecordTag::AddTx,
                (OpKind::Update, true) => RecordTag::UpdateTx,
                (OpKind::Delete, true) => RecordTag::DeleteTx,
            },
            Self::Prepare { .. } => RecordTag::Prepare,
            Self::Commit { .. } => RecordTag::Commit,
            Self::Rollback { .. } => RecordTag::Rollback,
        }
    }

    /// Returns the transaction ID if this record belongs to one.
    #[must_use]
    pub fn tx_id(&self) -> Option<TransactionId> {
        match self {
            Self::Operation { record, .. } => record.tx_id,
            Self::Prepare { tx_id, .. } | Self::Commit { tx_id } | Self::Rollback { tx_id } => {
                Some(*tx_id)
            }
        }
    }

    /// Returns the record id of an operation.
    #[must_use]
    pub fn record_id(&self) -> Option<u64> {
        match self {
            Self::Operation { record, .. } => Some(record.id),
            _ => None,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Operation { record, .. } => {
                let tx = if record.tx_id.is_some() { 8 } else { 0 };
                tx + 8 + 1 + 4 + record.payload.len()
            }
            Self::Prepare { data, .. } => 8 + 4 + data.len(),
            Self::Commit { .. } | Self::Rollback { .. } => 8,
        }
    }

    /// Returns the size of the encoded record including the envelope.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body_len() + TRAILER_SIZE
    }

    /// Encodes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidArgument`] if the body exceeds
    /// [`Self::MAX_BODY_SIZE`].
    pub fn encode(&self) -> JournalResult<Vec<u8>> {
        let body_len = self.body_len();
        let len = u32::try_from(body_len).map_err(|_| {
            JournalError::invalid_argument(format!(
                "record body of {body_len} bytes exceeds the maximum of {} bytes",
                Self::MAX_BODY_SIZE
            ))
        })?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + body_len + TRAILER_SIZE);
        buf.extend_from_slice(&RECORD_MAGIC);
        buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        buf.push(self.tag().as_byte());
        buf.extend_from_slice(&len.to_le_bytes());

        match self {
            Self::Operation { record, .. } => {
                if let Some(tx_id) = record.tx_id {
                    buf.extend_from_slice(&tx_id.as_u64().to_le_bytes());
                }
                buf.extend_from_slice(&record.id.to_le_bytes());
                buf.push(record.user_type);
                // Fits: the whole body fits in a u32.
                buf.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(&record.payload);
            }
            Self::Prepare { tx_id, data } => {
                buf.extend_from_slice(&tx_id.as_u64().to_le_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
            }
            Self::Commit { tx_id } | Self::Rollback { tx_id } => {
                buf.extend_from_slice(&tx_id.as_u64().to_le_bytes());
            }
        }

        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes one record from the start of `data`.
    ///
    /// Returns the record and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::TruncatedRecord`] when the record extends past
    /// the end of `data`, and [`JournalError::CorruptRecord`] for any other
    /// failure.
    pub fn decode(data: &[u8]) -> JournalResult<(Self, usize)> {
        decode_envelope(data).map_err(DecodeError::into_error)
    }
}

/// Why an envelope could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// Fewer bytes remain than the record needs.
    Truncated { needed: usize, available: usize },
    /// The bytes are present but wrong. `record_len` is known once the
    /// header has been validated.
    Corrupt {
        reason: String,
        record_len: Option<usize>,
    },
}

impl DecodeError {
    fn corrupt(reason: impl Into<String>, record_len: Option<usize>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
            record_len,
        }
    }

    pub(crate) fn into_error(self) -> JournalError {
        match self {
            Self::Truncated { needed, available } => {
                JournalError::TruncatedRecord { needed, available }
            }
            Self::Corrupt { reason, .. } => JournalError::CorruptRecord { reason },
        }
    }

    pub(crate) fn reason(&self) -> String {
        match self {
            Self::Truncated { needed, available } => {
                format!("truncated record: needed {needed} bytes, {available} available")
            }
            Self::Corrupt { reason, .. } => reason.clone(),
        }
    }
}

/// Validates a header and returns the full encoded length it declares.
pub(crate) fn declared_len(header: &[u8]) -> Result<usize, DecodeError> {
    if header.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: HEADER_SIZE,
            available: header.len(),
        });
    }
    if header[0..4] != RECORD_MAGIC {
        return Err(DecodeError::corrupt("invalid magic", None));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version == 0 || version > RECORD_VERSION {
        return Err(DecodeError::corrupt(
            format!("unsupported version {version}"),
            None,
        ));
    }
    if RecordTag::from_byte(header[6]).is_none() {
        return Err(DecodeError::corrupt(
            format!("unknown record tag {}", header[6]),
            None,
        ));
    }
    let body_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    Ok(HEADER_SIZE + body_len + TRAILER_SIZE)
}

pub(crate) fn decode_envelope(data: &[u8]) -> Result<(JournalRecord, usize), DecodeError> {
    let total = declared_len(data)?;
    if data.len() < total {
        return Err(DecodeError::Truncated {
            needed: total,
            available: data.len(),
        });
    }

    let crc_offset = total - TRAILER_SIZE;
    let stored = u32::from_le_bytes([
        data[crc_offset],
        data[crc_offset + 1],
        data[crc_offset + 2],
        data[crc_offset + 3],
    ]);
    let computed = compute_crc32(&data[..crc_offset]);
    if stored != computed {
        return Err(DecodeError::corrupt(
            format!("checksum mismatch: expected {stored:08x}, got {computed:08x}"),
            Some(total),
        ));
    }

    // Validated by declared_len.
    let tag = RecordTag::from_byte(data[6])
        .ok_or_else(|| DecodeError::corrupt("unknown record tag", Some(total)))?;
    let record = decode_body(tag, &data[HEADER_SIZE..crc_offset])
        .map_err(|reason| DecodeError::corrupt(reason, Some(total)))?;
    Ok((record, total))
}

struct BodyReader<'a> {
    body: &'a [u8],
    cursor: usize,
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.cursor + n > self.body.len() {
            return Err("unexpected end of body".to_string());
        }
        let slice = &self.body[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, String> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| "invalid u32".to_string())?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| "invalid u64".to_string())?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, String> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> Result<(), String> {
        if self.cursor != self.body.len() {
            return Err(format!(
                "{} trailing bytes in body",
                self.body.len() - self.cursor
            ));
        }
        Ok(())
    }
}

fn decode_body(tag: RecordTag, body: &[u8]) -> Result<JournalRecord, String> {
    let mut reader = BodyReader { body, cursor: 0 };

    let record = match tag {
        RecordTag::Add | RecordTag::Update | RecordTag::Delete => {
            operation(tag, None, &mut reader)?
        }
        RecordTag::AddTx | RecordTag::UpdateTx | RecordTag::DeleteTx => {
            let tx_id = TransactionId(reader.u64()?);
            operation(tag, Some(tx_id), &mut reader)?
        }
        RecordTag::Prepare => JournalRecord::Prepare {
            tx_id: TransactionId(reader.u64()?),
            data: reader.bytes()?,
        },
        RecordTag::Commit => JournalRecord::Commit {
            tx_id: TransactionId(reader.u64()?),
        },
        RecordTag::Rollback => JournalRecord::Rollback {
            tx_id: TransactionId(reader.u64()?),
        },
    };

    reader.finish()?;
    Ok(record)
}

fn operation(
    tag: RecordTag,
    tx_id: Option<TransactionId>,
    reader: &mut BodyReader<'_>,
) -> Result<JournalRecord, String> {
    let op = match tag {
        RecordTag::Add | RecordTag::AddTx => OpKind::Add,
        RecordTag::Update | RecordTag::UpdateTx => OpKind::Update,
        _ => OpKind::Delete,
    };
    let id = reader.u64()?;
    let user_type = reader.u8()?;
    let payload = reader.bytes()?;
    Ok(JournalRecord::Operation {
        op,
        record: Record {
            id,
            user_type,
            payload,
            tx_id,
        },
    })
}

/// Computes the CRC-32 (IEEE) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(id: u64) -> JournalRecord {
        JournalRecord::Operation {
            op: OpKind::Add,
            record: Record::new(id, 3, vec![1, 2, 3]),
        }
    }

    #[test]
    fn tag_from_byte_covers_all() {
        for tag in RecordTag::ALL {
            assert_eq!(RecordTag::from_byte(tag.as_byte()), Some(tag));
        }
        assert_eq!(RecordTag::from_byte(0), None);
        assert_eq!(RecordTag::from_byte(10), None);
    }

    #[test]
    fn transactional_ops_use_tx_tags() {
        let record = JournalRecord::Operation {
            op: OpKind::Delete,
            record: Record::new(1, 0, Vec::new()).in_tx(TransactionId(9)),
        };
        assert_eq!(record.tag(), RecordTag::DeleteTx);
        assert_eq!(record.tx_id(), Some(TransactionId(9)));
    }

    #[test]
    fn encode_decode_every_kind() {
        let tx = TransactionId(7);
        let records = vec![
            add(1),
            JournalRecord::Operation {
                op: OpKind::Update,
                record: Record::new(1, 4, b"v2".to_vec()).in_tx(tx),
            },
            JournalRecord::Prepare {
                tx_id: tx,
                data: b"xid-7".to_vec(),
            },
            JournalRecord::Commit { tx_id: tx },
            JournalRecord::Rollback { tx_id: tx },
        ];

        for record in records {
            let bytes = record.encode().unwrap();
            assert_eq!(bytes.len(), record.encoded_len());
            let (decoded, used) = JournalRecord::decode(&bytes).unwrap();
            assert_eq!(decoded, record);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn envelope_layout() {
        let bytes = JournalRecord::Commit {
            tx_id: TransactionId(1),
        }
        .encode()
        .unwrap();
        assert_eq!(&bytes[0..4], b"SLJR");
        assert_eq!(bytes[6], RecordTag::Commit.as_byte());
        assert_eq!(bytes.len(), MIN_RECORD_SIZE);
    }

    #[test]
    fn crc_mismatch_is_corrupt() {
        let mut bytes = add(1).encode().unwrap();
        bytes[HEADER_SIZE] ^= 0xFF;
        let result = JournalRecord::decode(&bytes);
        assert!(matches!(result, Err(JournalError::CorruptRecord { .. })));
        assert!(matches!(
            decode_envelope(&bytes),
            Err(DecodeError::Corrupt {
                record_len: Some(_),
                ..
            })
        ));
    }

    #[test]
    fn short_buffer_is_truncated() {
        let bytes = add(1).encode().unwrap();
        let result = JournalRecord::decode(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(JournalError::TruncatedRecord { .. })));

        let result = JournalRecord::decode(&bytes[..5]);
        assert!(matches!(
            result,
            Err(JournalError::TruncatedRecord { needed: 11, .. })
        ));
    }

    #[test]
    fn bad_magic_version_and_tag() {
        let good = add(1).encode().unwrap();

        let mut bytes = good.clone();
        bytes[0] = b'X';
        assert!(matches!(
            decode_envelope(&bytes),
            Err(DecodeError::Corrupt {
                record_len: None,
                ..
            })
        ));

        let mut bytes = good.clone();
        bytes[4] = 9;
        assert!(JournalRecord::decode(&bytes).is_err());

        let mut bytes = good;
        bytes[6] = 42;
        assert!(matches!(
            JournalRecord::decode(&bytes),
            Err(JournalError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn decode_reads_only_first_record() {
        let mut bytes = add(1).encode().unwrap();
        let first_len = bytes.len();
        bytes.extend(add(2).encode().unwrap());
        let (record, used) = JournalRecord::decode(&bytes).unwrap();
        assert_eq!(record.record_id(), Some(1));
        assert_eq!(used, first_len);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn record_strategy() -> impl Strategy<Value = JournalRecord> {
            let tx = prop::option::of(any::<u64>().prop_map(TransactionId::new));
            let op = prop_oneof![Just(OpKind::Add), Just(OpKind::Update), Just(OpKind::Delete)];
            prop_oneof![
                (op, any::<u64>(), any::<u8>(), prop::collection::vec(any::<u8>(), 0..256), tx)
                    .prop_map(|(op, id, user_type, payload, tx_id)| {
                        let mut record = Record::new(id, user_type, payload);
                        record.tx_id = tx_id;
                        JournalRecord::Operation { op, record }
                    }),
                (any::<u64>(), prop::collection::vec(any::<u8>(), 0..64)).prop_map(|(tx, data)| {
                    JournalRecord::Prepare {
                        tx_id: TransactionId::new(tx),
                        data,
                    }
                }),
                any::<u64>().prop_map(|tx| JournalRecord::Commit {
                    tx_id: TransactionId::new(tx)
                }),
                any::<u64>().prop_map(|tx| JournalRecord::Rollback {
                    tx_id: TransactionId::new(tx)
                }),
            ]
        }

        proptest! {
            #[test]
            fn decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
                let _ = JournalRecord::decode(&data);
            }

            #[test]
            fn encoded_len_is_exact(record in record_strategy()) {
                let bytes = record.encode().unwrap();
                prop_assert_eq!(bytes.len(), record.encoded_len());
                let (decoded, used) = JournalRecord::decode(&bytes).unwrap();
                prop_assert_eq!(used, bytes.len());
                prop_assert_eq!(decoded, record);
            }

            #[test]
            fn any_prefix_is_truncated(record in record_strategy(), cut in 1usize..64) {
                let bytes = record.encode().unwrap();
                let keep = bytes.len().saturating_sub(cut);
                prop_assert!(JournalRecord::decode(&bytes[..keep]).is_err());
            }
        }
    }
}
