//! Ordered record stream for replication.
//!
//! Every successfully written record is sent to each subscriber while the
//! writer lock is still held, so subscribers observe exactly the on-disk
//! order. Disconnected subscribers are dropped on the next send.
//!
//! An unbounded subscriber queues every record until it is received. A
//! bounded subscriber whose queue is full is cut off instead of stalling
//! the writer: it drains what was queued, then sees the channel close.

use crate::types::SegmentId;
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use tracing::warn;

/// One record as written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedRecord {
    /// Segment the record was written to.
    pub segment: SegmentId,
    /// Offset of the record within the segment.
    pub offset: u64,
    /// The encoded record, envelope included.
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
enum Subscriber {
    Unbounded(Sender<ReplicatedRecord>),
    Bounded(SyncSender<ReplicatedRecord>),
}

impl Subscriber {
    /// Hands over a record; `false` means the subscriber is gone.
    fn deliver(&self, record: ReplicatedRecord) -> bool {
        match self {
            Self::Unbounded(tx) => tx.send(record).is_ok(),
            Self::Bounded(tx) => match tx.try_send(record) {
                Ok(()) => true,
                Err(TrySendError::Full(record)) => {
                    warn!(
                        segment = %record.segment,
                        offset = record.offset,
                        "replication subscriber fell behind, disconnecting"
                    );
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }
}

/// Fan-out of written records to subscribers.
#[derive(Debug, Default)]
pub(crate) struct ReplicationFeed {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl ReplicationFeed {
    pub(crate) fn subscribe(&self) -> Receiver<ReplicatedRecord> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(Subscriber::Unbounded(tx));
        rx
    }

    pub(crate) fn subscribe_bounded(&self, capacity: usize) -> Receiver<ReplicatedRecord> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        self.subscribers.write().push(Subscriber::Bounded(tx));
        rx
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subscribers.read().is_empty()
    }

    pub(crate) fn emit(&self, record: ReplicatedRecord) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|subscriber| subscriber.deliver(record.clone()));
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
