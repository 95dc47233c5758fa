//! The compaction control file.
//!
//! Written atomically just before a compaction publishes. While it exists,
//! recovery knows which segments the outputs replace and rolls the
//! publish forward instead of replaying both generations.

use crate::error::{JournalError, JournalResult};
use crate::record::compute_crc32;
use crate::segment::SegmentNaming;
use crate::types::SegmentId;
use sluice_storage::FileFactory;
use tracing::{info, warn};

/// Name of the control file inside the journal directory.
pub const CONTROL_FILE: &str = "COMPACT";

const CONTROL_MAGIC: [u8; 4] = *b"SLCP";
const CONTROL_VERSION: u16 = 1;

/// Segments replaced by a compaction and the outputs replacing them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ControlFile {
    pub(crate) replaced: Vec<SegmentId>,
    pub(crate) outputs: Vec<SegmentId>,
}

impl ControlFile {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(14 + 8 * (self.replaced.len() + self.outputs.len()));
        buf.extend_from_slice(&CONTROL_MAGIC);
        buf.extend_from_slice(&CONTROL_VERSION.to_le_bytes());
        for ids in [&self.replaced, &self.outputs] {
            buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
            for id in ids {
                buf.extend_from_slice(&id.as_u64().to_le_bytes());
            }
        }
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    pub(crate) fn decode(data: &[u8]) -> JournalResult<Self> {
        let invalid = |reason: &str| JournalError::corrupt_record(format!("control file: {reason}"));

        if data.len() < 10 || data[0..4] != CONTROL_MAGIC {
            return Err(invalid("invalid magic"));
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if stored != compute_crc32(body) {
            return Err(invalid("checksum mismatch"));
        }
        let version = u16::from_le_bytes([body[4], body[5]]);
        if version > CONTROL_VERSION {
            return Err(invalid("unsupported version"));
        }

        let mut cursor = 6;
        let mut read_ids = || -> JournalResult<Vec<SegmentId>> {
            let count_bytes: [u8; 4] = body
                .get(cursor..cursor + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| invalid("unexpected end"))?;
            cursor += 4;
            let count = u32::from_le_bytes(count_bytes) as usize;
            let mut ids = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let id_bytes: [u8; 8] = body
                    .get(cursor..cursor + 8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| invalid("unexpected end"))?;
                cursor += 8;
                ids.push(SegmentId(u64::from_le_bytes(id_bytes)));
            }
            Ok(ids)
        };
        let replaced = read_ids()?;
        let outputs = read_ids()?;
        Ok(Self { replaced, outputs })
    }

    pub(crate) fn write(&self, factory: &dyn FileFactory) -> JournalResult<()> {
        factory.write_atomic(CONTROL_FILE, &self.encode())?;
        Ok(())
    }
}

/// Finishes or discards an interrupted compaction.
///
/// With a control file present the publish is rolled forward: pending
/// outputs are renamed into place and replaced segments deleted. Any
/// compaction output left without a control file is deleted.
pub(crate) fn recover(factory: &dyn FileFactory, naming: &SegmentNaming) -> JournalResult<()> {
    if factory.exists(CONTROL_FILE) {
        let control = ControlFile::decode(&factory.read_all(CONTROL_FILE)?)?;
        for id in &control.outputs {
            let pending = naming.compacting_name(*id);
            if factory.exists(&pending) {
                factory.rename(&pending, &naming.file_name(*id))?;
            }
        }
        for id in &control.replaced {
            match factory.delete(&naming.file_name(*id)) {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {}
            }
        }
        factory.sync_dir()?;
        factory.delete(CONTROL_FILE)?;
        info!(
            replaced = control.replaced.len(),
            outputs = control.outputs.len(),
            "interrupted compaction rolled forward"
        );
    }

    for name in factory.list(crate::segment::COMPACTING_EXTENSION)? {
        if naming.parse_compacting(&name).is_some() {
            warn!(file = %name, "discarding unpublished compaction output");
            factory.delete(&name)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_storage::InMemoryFactory;

    #[test]
    fn encode_decode() {
        let control = ControlFile {
            replaced: vec![SegmentId(1), SegmentId(2)],
            outputs: vec![SegmentId(5)],
        };
        assert_eq!(ControlFile::decode(&control.encode()).unwrap(), control);
    }

    #[test]
    fn damaged_control_file_is_rejected() {
        let mut bytes = ControlFile::default().encode();
        bytes[6] ^= 1;
        assert!(ControlFile::decode(&bytes).is_err());
        assert!(ControlFile::decode(b"junk").is_err());
    }

    #[test]
    fn recover_rolls_forward() {
        let factory = InMemoryFactory::new();
        let naming = SegmentNaming::new("sluice", "jrn");
        factory.set_file_data(&naming.file_name(SegmentId(1)), vec![1]);
        factory.set_file_data(&naming.file_name(SegmentId(2)), vec![2]);
        factory.set_file_data(&naming.compacting_name(SegmentId(3)), vec![3]);
        ControlFile {
            replaced: vec![SegmentId(1), SegmentId(2)],
            outputs: vec![SegmentId(3)],
        }
        .write(&factory)
        .unwrap();

        recover(&factory, &naming).unwrap();
        assert_eq!(
            factory.file_names(),
            vec![naming.file_name(SegmentId(3))]
        );
    }

    #[test]
    fn recover_discards_orphan_outputs() {
        let factory = InMemoryFactory::new();
        let naming = SegmentNaming::new("sluice", "jrn");
        factory.set_file_data(&naming.file_name(SegmentId(1)), vec![1]);
        factory.set_file_data(&naming.compacting_name(SegmentId(2)), vec![2]);

        recover(&factory, &naming).unwrap();
        assert_eq!(
            factory.file_names(),
            vec![naming.file_name(SegmentId(1))]
        );
    }
}
