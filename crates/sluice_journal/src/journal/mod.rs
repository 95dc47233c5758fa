//! The journal: ordered, durable record operations with transactions.
//!
//! ## Lifecycle
//!
//! ```text
//! open -> load (once) -> append / prepare / commit / rollback ... -> drop
//!                   \-> any write failure -> failed (every call: IoFailure)
//! ```
//!
//! ## Concurrency
//!
//! All writes pass through one writer lock, so the on-disk order is a
//! serialization of the callers' real-time order. The published segment
//! set is an `Arc` swapped as a whole; readers clone it and never block
//! the writer for longer than the clone.
//!
//! ## Example
//!
//! ```rust
//! use sluice_journal::{Journal, JournalConfig, TransactionId};
//! use sluice_storage::InMemoryFactory;
//! use std::sync::Arc;
//!
//! let journal = Journal::with_factory(Arc::new(InMemoryFactory::new()), JournalConfig::default()).unwrap();
//! journal.load().unwrap();
//!
//! journal.add(1, 0, b"hello".to_vec()).unwrap();
//! let tx = TransactionId::new(7);
//! journal.add_tx(tx, 2, 0, b"world".to_vec()).unwrap();
//! journal.prepare(tx, Vec::new()).unwrap();
//! journal.commit(tx).unwrap();
//! ```

mod active;
mod control;
mod load;
mod replication;

pub use control::CONTROL_FILE;
pub use load::{LoadSummary, LoadedJournal, PreparedTransaction};
pub use replication::ReplicatedRecord;

pub(crate) use active::ActiveJournal;
pub(crate) use control::ControlFile;

use crate::compactor::{self, CompactionReport, CompactorHandle};
use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::record::{JournalRecord, OpKind, Record};
use crate::segment::{PublishedSegments, SegmentInfo, SegmentRecords};
use crate::stats::{JournalStats, JournalStatsSnapshot};
use crate::types::{SegmentId, TransactionId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use replication::ReplicationFeed;
use sluice_storage::{DirectoryFactory, FileFactory};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::error;

pub(crate) enum Stage {
    Created,
    Active(Box<ActiveJournal>),
    Failed(String),
}

impl Stage {
    pub(crate) fn active_mut(&mut self) -> JournalResult<&mut ActiveJournal> {
        match self {
            Self::Created => Err(JournalError::NotLoaded),
            Self::Active(active) => Ok(active),
            Self::Failed(message) => Err(JournalError::io_failure(message.clone())),
        }
    }

    /// Moves the journal into the failed state and returns the error every
    /// later call will see.
    pub(crate) fn fail(&mut self, err: &JournalError) -> JournalError {
        let message = err.to_string();
        error!(error = %message, "journal write failed, refusing further writes");
        *self = Self::Failed(message.clone());
        JournalError::io_failure(message)
    }
}

pub(crate) struct JournalShared {
    pub(crate) config: JournalConfig,
    pub(crate) factory: Arc<dyn FileFactory>,
    pub(crate) state: Mutex<Stage>,
    pub(crate) published: PublishedSegments,
    pub(crate) stats: JournalStats,
    pub(crate) compacting: AtomicBool,
    feed: ReplicationFeed,
}

/// A segmented, transactional journal.
///
/// `Journal` is a cheap handle; clones share the same journal.
#[derive(Clone)]
pub struct Journal {
    pub(crate) shared: Arc<JournalShared>,
}

impl Journal {
    /// Opens a journal in a directory, taking its exclusive lock.
    ///
    /// Nothing is read until [`Journal::load`].
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Locked`] if another process holds the
    /// directory, or an error if the configuration is invalid.
    pub fn open(dir: &Path, config: JournalConfig) -> JournalResult<Self> {
        config.validate()?;
        let factory = DirectoryFactory::open(dir).map_err(JournalError::from_open)?;
        Self::with_factory(Arc::new(factory), config)
    }

    /// Creates a journal over any file factory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_factory(factory: Arc<dyn FileFactory>, config: JournalConfig) -> JournalResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(JournalShared {
                config,
                factory,
                state: Mutex::new(Stage::Created),
                published: Arc::new(RwLock::new(Arc::new(Vec::new()))),
                stats: JournalStats::new(),
                compacting: AtomicBool::new(false),
                feed: ReplicationFeed::default(),
            }),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.shared.config
    }

    /// Recovers the journal and makes it writable.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::AlreadyLoaded`] on a second call, or
    /// [`JournalError::JournalCorruption`] if a segment is damaged anywhere
    /// but its final record.
    pub fn load(&self) -> JournalResult<LoadedJournal> {
        let mut state = self.shared.state.lock();
        match &*state {
            Stage::Created => {}
            Stage::Active(_) => return Err(JournalError::AlreadyLoaded),
            Stage::Failed(message) => return Err(JournalError::io_failure(message.clone())),
        }

        let (active, loaded) = load::recover(
            Arc::clone(&self.shared.factory),
            &self.shared.config,
            Arc::clone(&self.shared.published),
            &self.shared.stats,
        )?;
        *state = Stage::Active(Box::new(active));
        Ok(loaded)
    }

    /// Appends one record operation.
    ///
    /// The operation is transactional when `record.tx_id` is set.
    ///
    /// # Errors
    ///
    /// - [`JournalError::NotLoaded`] before `load`
    /// - [`JournalError::InvalidTransactionState`] for an operation on a
    ///   prepared transaction
    /// - [`JournalError::InvalidArgument`] if the record cannot fit a segment
    /// - [`JournalError::IoFailure`] if the write failed or an earlier one did
    pub fn append(&self, op: OpKind, record: Record) -> JournalResult<()> {
        self.submit(JournalRecord::Operation { op, record })
    }

    /// Appends a non-transactional add.
    ///
    /// # Errors
    ///
    /// See [`Journal::append`].
    pub fn add(&self, id: u64, user_type: u8, payload: impl Into<Vec<u8>>) -> JournalResult<()> {
        self.append(OpKind::Add, Record::new(id, user_type, payload))
    }

    /// Appends a non-transactional update.
    ///
    /// # Errors
    ///
    /// See [`Journal::append`].
    pub fn update(&self, id: u64, user_type: u8, payload: impl Into<Vec<u8>>) -> JournalResult<()> {
        self.append(OpKind::Update, Record::new(id, user_type, payload))
    }

    /// Appends a non-transactional delete.
    ///
    /// # Errors
    ///
    /// See [`Journal::append`].
    pub fn delete(&self, id: u64) -> JournalResult<()> {
        self.append(OpKind::Delete, Record::new(id, 0, Vec::new()))
    }

    /// Appends an add inside a transaction.
    ///
    /// # Errors
    ///
    /// See [`Journal::append`].
    pub fn add_tx(
        &self,
        tx_id: TransactionId,
        id: u64,
        user_type: u8,
        payload: impl Into<Vec<u8>>,
    ) -> JournalResult<()> {
        self.append(OpKind::Add, Record::new(id, user_type, payload).in_tx(tx_id))
    }

    /// Appends an update inside a transaction.
    ///
    /// # Errors
    ///
    /// See [`Journal::append`].
    pub fn update_tx(
        &self,
        tx_id: TransactionId,
        id: u64,
        user_type: u8,
        payload: impl Into<Vec<u8>>,
    ) -> JournalResult<()> {
        self.append(
            OpKind::Update,
            Record::new(id, user_type, payload).in_tx(tx_id),
        )
    }

    /// Appends a delete inside a transaction.
    ///
    /// # Errors
    ///
    /// See [`Journal::append`].
    pub fn delete_tx(&self, tx_id: TransactionId, id: u64) -> JournalResult<()> {
        self.append(OpKind::Delete, Record::new(id, 0, Vec::new()).in_tx(tx_id))
    }

    /// Writes the prepare marker of a transaction.
    ///
    /// `data` is stored with the marker and reported back for in-doubt
    /// transactions (typically the XID).
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidTransactionState`] if the transaction
    /// is already prepared.
    pub fn prepare(&self, tx_id: TransactionId, data: impl Into<Vec<u8>>) -> JournalResult<()> {
        self.submit(JournalRecord::Prepare {
            tx_id,
            data: data.into(),
        })
    }

    /// Commits a prepared transaction.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::UnknownTransaction`] without a matching prepare.
    pub fn commit(&self, tx_id: TransactionId) -> JournalResult<()> {
        self.submit(JournalRecord::Commit { tx_id })
    }

    /// Rolls back a prepared transaction.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::UnknownTransaction`] without a matching prepare.
    pub fn rollback(&self, tx_id: TransactionId) -> JournalResult<()> {
        self.submit(JournalRecord::Rollback { tx_id })
    }

    fn submit(&self, record: JournalRecord) -> JournalResult<()> {
        let mut state = self.shared.state.lock();
        let active = state.active_mut()?;
        active.check(&record)?;
        let bytes = active.encode_checked(&record)?;

        let written = active.write_encoded(&bytes, &self.shared.stats);
        match written {
            Ok(location) => {
                active.apply(&record, location);
                self.shared.stats.record_append(&record, bytes.len());
                if self.shared.feed.has_subscribers() {
                    self.shared.feed.emit(ReplicatedRecord {
                        segment: location.segment,
                        offset: location.offset,
                        bytes,
                    });
                }
                Ok(())
            }
            Err(err) => {
                self.shared.stats.record_error();
                Err(state.fail(&err))
            }
        }
    }

    /// Subscribes to the ordered stream of written records.
    ///
    /// The queue is unbounded: a receiver that is kept but never read
    /// holds every record written after it subscribed. Use
    /// [`Journal::subscribe_bounded`] when the reader may stall.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ReplicatedRecord> {
        self.shared.feed.subscribe()
    }

    /// Subscribes with a queue of at most `capacity` records (at least one).
    ///
    /// Writes never wait on the subscriber. Once its queue is full the
    /// subscriber is disconnected: it can still receive what was queued,
    /// after which the channel reports disconnection and the caller should
    /// resynchronize from the segments.
    #[must_use]
    pub fn subscribe_bounded(&self, capacity: usize) -> Receiver<ReplicatedRecord> {
        self.shared.feed.subscribe_bounded(capacity)
    }

    /// Describes every segment, in id order.
    ///
    /// Empty before `load`.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentInfo> {
        match &*self.shared.state.lock() {
            Stage::Active(active) => active.segments.infos(),
            _ => Vec::new(),
        }
    }

    /// Streams the records of a published segment.
    ///
    /// The segment is not deleted while the returned iterator lives.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidArgument`] for an unknown segment.
    pub fn read_segment(&self, id: SegmentId) -> JournalResult<SegmentRecords> {
        let published = Arc::clone(&self.shared.published.read());
        let segment = published
            .iter()
            .find(|s| s.id() == id)
            .ok_or_else(|| JournalError::invalid_argument(format!("unknown segment {id}")))?;
        segment.records()
    }

    /// Returns the number of live records.
    #[must_use]
    pub fn live_records(&self) -> usize {
        match &*self.shared.state.lock() {
            Stage::Active(active) => active.live.len(),
            _ => 0,
        }
    }

    /// Returns the bytes held live by current records and pending
    /// transactions.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        match &*self.shared.state.lock() {
            Stage::Active(active) => active.live_bytes(),
            _ => 0,
        }
    }

    /// Returns the ids of unresolved transactions, sorted.
    #[must_use]
    pub fn pending_transactions(&self) -> Vec<TransactionId> {
        match &*self.shared.state.lock() {
            Stage::Active(active) => {
                let mut ids: Vec<_> = active.pending.keys().copied().collect();
                ids.sort();
                ids
            }
            _ => Vec::new(),
        }
    }

    /// Returns whether a write failure has stopped the journal.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(&*self.shared.state.lock(), Stage::Failed(_))
    }

    /// Returns a snapshot of the journal counters.
    #[must_use]
    pub fn stats(&self) -> JournalStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Returns whether the compaction policy currently asks for a run.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        let policy = &self.shared.config.compaction;
        match &*self.shared.state.lock() {
            Stage::Active(active) => {
                let (sealed, dead, candidates) =
                    active.segments.sealed_usage(policy.candidate_occupancy);
                policy.should_compact(sealed, dead, candidates)
            }
            _ => false,
        }
    }

    /// Runs one compaction pass synchronously, regardless of the policy's
    /// trigger rules.
    ///
    /// The pass rewrites the oldest run of segments below
    /// [`candidate_occupancy`](crate::CompactionPolicy::candidate_occupancy).
    /// With no such run it only retries deferred deletions and returns an
    /// empty report.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::CompactionInProgress`] if another run is
    /// active, or [`JournalError::CompactionFailed`] if the run aborted;
    /// the journal is unchanged in that case.
    pub fn compact(&self) -> JournalResult<CompactionReport> {
        compactor::run(self)
    }

    /// Starts the background compactor thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_compactor(&self) -> JournalResult<CompactorHandle> {
        CompactorHandle::spawn(self.clone())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, Stage> {
        self.shared.state.lock()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
