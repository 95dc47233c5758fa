//! Segment allocation, accounting and deletion.

use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::segment::file::SegmentFile;
use crate::segment::naming::SegmentNaming;
use crate::types::SegmentId;
use parking_lot::RwLock;
use serde::Serialize;
use sluice_storage::FileFactory;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// The published segment set, swapped atomically as a whole.
pub(crate) type PublishedSegments = Arc<RwLock<Arc<Vec<Arc<SegmentFile>>>>>;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    /// The single segment accepting appends.
    Writable,
    /// Sealed; holds live bytes.
    Full,
    /// Sealed with no live bytes; eligible for deletion.
    Reclaimable,
    /// Removed from disk.
    Deleted,
}

/// A point-in-time description of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    /// Segment id.
    pub id: SegmentId,
    /// File name.
    pub name: String,
    /// Lifecycle state.
    pub state: SegmentState,
    /// Bytes written.
    pub size: u64,
    /// Bytes belonging to current records or pending transactions.
    pub live_bytes: u64,
    /// `size - live_bytes`.
    pub dead_bytes: u64,
}

impl SegmentInfo {
    /// Returns the live percentage of the written bytes (100 when empty).
    #[must_use]
    pub fn occupancy_percent(&self) -> u32 {
        if self.size == 0 {
            return 100;
        }
        // Fits: live_bytes <= size.
        (self.live_bytes.saturating_mul(100) / self.size) as u32
    }

    /// Returns whether the segment is a compaction candidate: it holds
    /// bytes, and fewer than `candidate_occupancy` percent of them are live.
    #[must_use]
    pub fn is_candidate(&self, candidate_occupancy: u32) -> bool {
        below_occupancy(self.size, self.live_bytes, candidate_occupancy)
    }
}

fn below_occupancy(size: u64, live_bytes: u64, candidate_occupancy: u32) -> bool {
    size > 0 && live_bytes.saturating_mul(100) < u64::from(candidate_occupancy) * size
}

#[derive(Debug)]
struct SegmentEntry {
    file: Arc<SegmentFile>,
    state: SegmentState,
    size: u64,
    live_bytes: u64,
}

/// Owns every segment file of a journal.
///
/// The manager lives behind the journal's writer lock. Readers never touch
/// it; they clone the published set instead.
pub struct SegmentManager {
    factory: Arc<dyn FileFactory>,
    naming: SegmentNaming,
    capacity: u64,
    min_segments: usize,
    next_id: SegmentId,
    entries: BTreeMap<SegmentId, SegmentEntry>,
    pool: VecDeque<Arc<SegmentFile>>,
    deferred: Vec<Arc<SegmentFile>>,
    published: PublishedSegments,
}

impl SegmentManager {
    /// Opens every segment in the factory, in id order.
    ///
    /// All opened segments start out [`SegmentState::Full`] with no live
    /// bytes; recovery fills in the accounting and picks the writable one.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or opening a file fails.
    pub fn open(factory: Arc<dyn FileFactory>, config: &JournalConfig) -> JournalResult<Self> {
        Self::open_with(factory, config, Arc::new(RwLock::new(Arc::new(Vec::new()))))
    }

    /// Opens the segments and publishes them through an existing handle.
    pub(crate) fn open_with(
        factory: Arc<dyn FileFactory>,
        config: &JournalConfig,
        published: PublishedSegments,
    ) -> JournalResult<Self> {
        let naming = SegmentNaming::from_config(config);
        let mut entries = BTreeMap::new();

        for name in factory.list(naming.extension())? {
            let Some(id) = naming.parse(&name) else {
                continue;
            };
            let backend = factory.open(&name)?;
            let size = backend.size()?;
            let file = Arc::new(SegmentFile::new(id, name, backend));
            entries.insert(
                id,
                SegmentEntry {
                    file,
                    state: SegmentState::Full,
                    size,
                    live_bytes: 0,
                },
            );
        }

        let next_id = entries
            .keys()
            .next_back()
            .map_or(SegmentId(1), |id| id.next());
        debug!(segments = entries.len(), next = %next_id, "segments opened");

        let manager = Self {
            factory,
            naming,
            capacity: config.segment_size,
            min_segments: config.min_segments,
            next_id,
            entries,
            pool: VecDeque::new(),
            deferred: Vec::new(),
            published,
        };
        manager.publish();
        Ok(manager)
    }

    /// Returns the shared handle to the published segment set.
    pub(crate) fn published(&self) -> PublishedSegments {
        Arc::clone(&self.published)
    }

    /// Returns the logical segment capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the naming scheme.
    #[must_use]
    pub fn naming(&self) -> &SegmentNaming {
        &self.naming
    }

    /// Returns the file factory.
    #[must_use]
    pub fn factory(&self) -> &Arc<dyn FileFactory> {
        &self.factory
    }

    /// Returns all segments in id order.
    #[must_use]
    pub fn files(&self) -> Vec<Arc<SegmentFile>> {
        self.entries.values().map(|e| Arc::clone(&e.file)).collect()
    }

    /// Returns a segment by id.
    #[must_use]
    pub fn get(&self, id: SegmentId) -> Option<&Arc<SegmentFile>> {
        self.entries.get(&id).map(|e| &e.file)
    }

    /// Returns the state of a segment.
    ///
    /// Ids below the next id that are no longer tracked report
    /// [`SegmentState::Deleted`]; pre-allocated pool files report `None`.
    #[must_use]
    pub fn state(&self, id: SegmentId) -> Option<SegmentState> {
        if let Some(entry) = self.entries.get(&id) {
            return Some(entry.state);
        }
        if id < self.next_id && !self.pool.iter().any(|f| f.id() == id) {
            return Some(SegmentState::Deleted);
        }
        None
    }

    /// Returns the writable segment, if one has been allocated.
    #[must_use]
    pub fn current(&self) -> Option<&Arc<SegmentFile>> {
        self.entries
            .values()
            .find(|e| e.state == SegmentState::Writable)
            .map(|e| &e.file)
    }

    /// Makes an existing segment the writable one (used by recovery).
    pub(crate) fn resume(&mut self, id: SegmentId) -> JournalResult<Arc<SegmentFile>> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| JournalError::invalid_argument(format!("unknown segment {id}")))?;
        entry.state = SegmentState::Writable;
        Ok(Arc::clone(&entry.file))
    }

    /// Moves trailing empty segments into the pre-allocated pool.
    pub(crate) fn adopt_empty_tail(&mut self, after: Option<SegmentId>) {
        let empty: Vec<SegmentId> = self
            .entries
            .iter()
            .filter(|(id, e)| Some(**id) > after && e.size == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in empty {
            if let Some(entry) = self.entries.remove(&id) {
                self.pool.push_back(entry.file);
            }
        }
        self.publish();
    }

    /// Allocates the next writable segment.
    ///
    /// The previous writable segment is sealed. A pre-allocated file is
    /// used when available, and the pool is topped back up to
    /// `min_segments`.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment file cannot be created.
    pub fn allocate_segment(&mut self) -> JournalResult<Arc<SegmentFile>> {
        let file = match self.pool.pop_front() {
            Some(file) => file,
            None => self.create_file()?,
        };
        if let Some(id) = self.current().map(|f| f.id()) {
            self.mark_full(id)?;
        }

        self.entries.insert(
            file.id(),
            SegmentEntry {
                file: Arc::clone(&file),
                state: SegmentState::Writable,
                size: 0,
                live_bytes: 0,
            },
        );
        if let Err(err) = self.fill_pool() {
            warn!(error = %err, "could not pre-allocate segments");
        }
        self.publish();

        debug!(segment = %file.id(), "segment allocated");
        Ok(file)
    }

    fn create_file(&mut self) -> JournalResult<Arc<SegmentFile>> {
        let id = self.next_id;
        self.next_id = id.next();
        let name = self.naming.file_name(id);
        let backend = self.factory.open(&name)?;
        Ok(Arc::new(SegmentFile::new(id, name, backend)))
    }

    fn fill_pool(&mut self) -> JournalResult<()> {
        while self.pool.len() < self.min_segments {
            let file = self.create_file()?;
            self.pool.push_back(file);
        }
        Ok(())
    }

    /// Deletes the pre-allocated pool files.
    ///
    /// Compaction does this before reserving output ids, since a pooled id
    /// would sort below the outputs.
    pub(crate) fn discard_pool(&mut self) -> JournalResult<()> {
        while let Some(file) = self.pool.pop_front() {
            let name = file.name().to_string();
            drop(file);
            self.factory.delete(&name)?;
        }
        Ok(())
    }

    /// Reserves `count` consecutive ids and returns the first.
    pub(crate) fn reserve_ids(&mut self, count: u64) -> SegmentId {
        let first = self.next_id;
        self.next_id = SegmentId(first.as_u64() + count);
        first
    }

    /// Seals the writable segment.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidArgument`] if the segment is not writable.
    pub fn mark_full(&mut self, id: SegmentId) -> JournalResult<()> {
        let entry = self.entry_mut(id)?;
        if entry.state != SegmentState::Writable {
            return Err(JournalError::invalid_argument(format!(
                "segment {id} is {:?}, not writable",
                entry.state
            )));
        }
        entry.state = if entry.live_bytes == 0 {
            SegmentState::Reclaimable
        } else {
            SegmentState::Full
        };
        Ok(())
    }

    /// Marks a sealed segment with no live bytes as reclaimable.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidArgument`] if the segment is writable
    /// or still holds live bytes.
    pub fn mark_reclaimable(&mut self, id: SegmentId) -> JournalResult<()> {
        let entry = self.entry_mut(id)?;
        if entry.state == SegmentState::Writable || entry.live_bytes > 0 {
            return Err(JournalError::invalid_argument(format!(
                "segment {id} is {:?} with {} live bytes",
                entry.state, entry.live_bytes
            )));
        }
        entry.state = SegmentState::Reclaimable;
        Ok(())
    }

    /// Physically deletes a reclaimable segment.
    ///
    /// Returns `false` when a reader still holds the segment; the deletion
    /// is then retried by [`SegmentManager::reclaim`].
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidArgument`] if the segment is not
    /// reclaimable, or a storage error if the delete fails.
    pub fn delete_segment(&mut self, id: SegmentId) -> JournalResult<bool> {
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| JournalError::invalid_argument(format!("unknown segment {id}")))?;
        if entry.state != SegmentState::Reclaimable {
            return Err(JournalError::invalid_argument(format!(
                "segment {id} is {:?}, not reclaimable",
                entry.state
            )));
        }
        self.remove(id)
    }

    /// Drops a segment from the set and deletes it once unreferenced.
    fn remove(&mut self, id: SegmentId) -> JournalResult<bool> {
        let Some(entry) = self.entries.remove(&id) else {
            return Ok(true);
        };
        self.publish();
        self.delete_file(entry.file)
    }

    fn delete_file(&mut self, file: Arc<SegmentFile>) -> JournalResult<bool> {
        if Arc::strong_count(&file) > 1 {
            debug!(segment = %file.id(), "segment deletion deferred, still referenced");
            self.deferred.push(file);
            return Ok(false);
        }
        let id = file.id();
        let name = file.name().to_string();
        drop(file);
        self.factory.delete(&name)?;
        debug!(segment = %id, "segment deleted");
        Ok(true)
    }

    /// Removes replaced segments after a compaction publish.
    ///
    /// The published set loses all of them at once. Returns the number of
    /// deletions that had to be deferred.
    pub(crate) fn retire(&mut self, ids: &[SegmentId]) -> JournalResult<usize> {
        let removed: Vec<Arc<SegmentFile>> = ids
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|entry| entry.file)
            .collect();
        self.publish();

        let mut deferred = 0;
        for file in removed {
            if !self.delete_file(file)? {
                deferred += 1;
            }
        }
        Ok(deferred)
    }

    /// Deletes the oldest run of reclaimable segments and retries deferred
    /// deletions. Returns the number of files deleted.
    ///
    /// The run stops at the first segment a reader still holds. Newer
    /// segments may carry the delete markers for its records, so none of
    /// them is deleted while its file is on disk.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a delete fails.
    pub fn reclaim(&mut self) -> JournalResult<usize> {
        let mut deleted = self.retry_deferred()?;
        let held_floor = self.deferred.iter().map(|file| file.id()).min();

        let oldest_run: Vec<SegmentId> = self
            .entries
            .iter()
            .take_while(|(_, e)| e.state == SegmentState::Reclaimable)
            .map(|(id, _)| *id)
            .collect();
        for id in oldest_run {
            if let Some(held) = held_floor.filter(|held| *held < id) {
                debug!(segment = %id, held = %held, "reclaim waits for an older segment");
                break;
            }
            if !self.delete_segment(id)? {
                break;
            }
            deleted += 1;
        }
        Ok(deleted)
    }

    fn retry_deferred(&mut self) -> JournalResult<usize> {
        let mut deleted = 0;
        let mut still_held = Vec::new();
        for file in std::mem::take(&mut self.deferred) {
            if Arc::strong_count(&file) > 1 {
                still_held.push(file);
                continue;
            }
            let name = file.name().to_string();
            drop(file);
            match self.factory.delete(&name) {
                Ok(()) => deleted += 1,
                Err(err) => warn!(file = %name, error = %err, "deferred segment delete failed"),
            }
        }
        self.deferred = still_held;
        Ok(deleted)
    }

    /// Returns whether deletions are still waiting on readers.
    #[must_use]
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Ids of removed segments whose files still exist.
    pub(crate) fn deferred_ids(&self) -> Vec<SegmentId> {
        self.deferred.iter().map(|file| file.id()).collect()
    }

    /// Registers a compaction output under its published name.
    pub(crate) fn install(&mut self, file: Arc<SegmentFile>, size: u64) {
        self.entries.insert(
            file.id(),
            SegmentEntry {
                file,
                state: SegmentState::Full,
                size,
                live_bytes: 0,
            },
        );
    }

    /// Records that `len` bytes were appended to a segment.
    pub(crate) fn record_append(&mut self, id: SegmentId, len: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.size += len;
        }
    }

    /// Counts `len` bytes of a segment as live.
    pub(crate) fn add_live(&mut self, id: SegmentId, len: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.live_bytes += len;
        }
    }

    /// Releases `len` live bytes; a sealed segment left with none becomes
    /// reclaimable.
    pub(crate) fn release(&mut self, id: SegmentId, len: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.live_bytes = entry.live_bytes.saturating_sub(len);
            if entry.live_bytes == 0 && entry.state == SegmentState::Full {
                entry.state = SegmentState::Reclaimable;
            }
        }
    }

    /// Recomputes reclaimable states after recovery filled in live bytes.
    pub(crate) fn settle_states(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.state == SegmentState::Full && entry.live_bytes == 0 {
                entry.state = SegmentState::Reclaimable;
            }
        }
    }

    /// Corrects the recorded size after recovery truncated a segment.
    pub(crate) fn set_size(&mut self, id: SegmentId, size: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.size = size;
        }
    }

    /// Returns `(sealed bytes, sealed dead bytes, candidate count)` for the
    /// compaction policy.
    #[must_use]
    pub fn sealed_usage(&self, candidate_occupancy: u32) -> (u64, u64, usize) {
        let mut sealed = 0;
        let mut dead = 0;
        let mut candidates = 0;
        for entry in self.entries.values() {
            if entry.state == SegmentState::Writable {
                continue;
            }
            sealed += entry.size;
            dead += entry.size.saturating_sub(entry.live_bytes);
            if below_occupancy(entry.size, entry.live_bytes, candidate_occupancy) {
                candidates += 1;
            }
        }
        (sealed, dead, candidates)
    }

    /// Returns a description of every segment in id order.
    #[must_use]
    pub fn infos(&self) -> Vec<SegmentInfo> {
        self.entries
            .iter()
            .map(|(id, e)| SegmentInfo {
                id: *id,
                name: e.file.name().to_string(),
                state: e.state,
                size: e.size,
                live_bytes: e.live_bytes,
                dead_bytes: e.size.saturating_sub(e.live_bytes),
            })
            .collect()
    }

    /// Returns the total live bytes across all segments.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.live_bytes).sum()
    }

    /// Zeroes all live-byte accounting (before recovery recomputes it).
    pub(crate) fn reset_live(&mut self) {
        for entry in self.entries.values_mut() {
            entry.live_bytes = 0;
        }
    }

    fn entry_mut(&mut self, id: SegmentId) -> JournalResult<&mut SegmentEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| JournalError::invalid_argument(format!("unknown segment {id}")))
    }

    /// Swaps in a fresh published set built from the tracked segments.
    pub(crate) fn publish(&self) {
        let files: Vec<Arc<SegmentFile>> =
            self.entries.values().map(|e| Arc::clone(&e.file)).collect();
        *self.published.write() = Arc::new(files);
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("next_id", &self.next_id)
            .field("segments", &self.entries.len())
            .field("pool", &self.pool.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}
