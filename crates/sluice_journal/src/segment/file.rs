//! A single segment file.

use crate::error::JournalResult;
use crate::segment::reader::SegmentRecords;
use crate::types::SegmentId;
use parking_lot::RwLock;
use sluice_storage::StorageBackend;
use std::fmt;
use std::sync::Arc;

/// One segment of the journal.
///
/// Segments are shared as `Arc<SegmentFile>`: the writer appends to the
/// current segment while replication and the compactor read sealed ones.
/// An append holds the write lock for the whole record, so a reader never
/// observes a partially written record.
pub struct SegmentFile {
    id: SegmentId,
    name: String,
    backend: RwLock<Box<dyn StorageBackend>>,
}

impl SegmentFile {
    pub(crate) fn new(id: SegmentId, name: String, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            id,
            name,
            backend: RwLock::new(backend),
        }
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> JournalResult<u64> {
        Ok(self.backend.read().size()?)
    }

    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds or the read fails.
    pub fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        Ok(self.backend.read().read_at(offset, len)?)
    }

    /// Streams the records currently in this segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment size cannot be determined.
    pub fn records(self: &Arc<Self>) -> JournalResult<SegmentRecords> {
        SegmentRecords::new(Arc::clone(self))
    }

    pub(crate) fn append(&self, data: &[u8], sync: bool) -> JournalResult<u64> {
        let mut backend = self.backend.write();
        let offset = backend.append(data)?;
        if sync {
            backend.sync()?;
        } else {
            backend.flush()?;
        }
        Ok(offset)
    }

    pub(crate) fn sync(&self) -> JournalResult<()> {
        self.backend.write().sync()?;
        Ok(())
    }

    pub(crate) fn truncate(&self, size: u64) -> JournalResult<()> {
        self.backend.write().truncate(size)?;
        Ok(())
    }
}

impl fmt::Debug for SegmentFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
