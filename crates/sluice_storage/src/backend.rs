//! The byte store under segment and page files.

use crate::error::StorageResult;

/// An append-only file.
///
/// Journal segments and page files are both sequences of self-delimiting
/// frames written at the end and read back by offset, so a backend only
/// needs to append, read a range, make data durable, and cut a torn tail
/// off during recovery. It never sees record boundaries.
///
/// `append` returns the offset the data starts at, which is always the
/// `size()` observed just before the call.
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// if the range is not fully written.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the file may then hold a
    /// prefix of `data`.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the write-back fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    fn size(&self) -> StorageResult<u64>;

    /// Flushes and fsyncs, so appended data survives a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails. Callers treat that as fatal for
    /// the journal or store that owns the file.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the file back to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TruncatePastEnd`](crate::StorageError::TruncatePastEnd)
    /// if `new_size` is larger than the file.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Returns whether nothing has been written.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.size()? == 0)
    }
}
