//! Property-based test generators using proptest.
//!
//! Record ids are drawn from a small range so that sequences update and
//! delete records they added earlier.

use proptest::prelude::*;

/// Upper bound (exclusive) of generated record ids.
pub const ID_SPACE: u64 = 32;

/// One record operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOp {
    /// Add a record.
    Add {
        /// Record id.
        id: u64,
        /// Record type.
        user_type: u8,
        /// Payload.
        payload: Vec<u8>,
    },
    /// Update a record.
    Update {
        /// Record id.
        id: u64,
        /// Record type.
        user_type: u8,
        /// Payload.
        payload: Vec<u8>,
    },
    /// Delete a record.
    Delete {
        /// Record id.
        id: u64,
    },
}

/// How a generated transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Prepare, then commit.
    Commit,
    /// Prepare, then roll back.
    Rollback,
    /// Prepare and leave it in doubt.
    InDoubt,
    /// Never prepared; discarded at the next load.
    Abandon,
}

/// One step of a generated journal workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    /// A non-transactional operation.
    Single(RecordOp),
    /// A transaction; the driver assigns its id.
    Transaction {
        /// Operations in order.
        ops: Vec<RecordOp>,
        /// How it ends.
        outcome: TxOutcome,
    },
}

/// Strategy for record ids.
pub fn record_id_strategy() -> impl Strategy<Value = u64> {
    0..ID_SPACE
}

/// Strategy for payloads small enough for test segments.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..48)
}

/// Strategy for a single record operation.
pub fn record_op_strategy() -> impl Strategy<Value = RecordOp> {
    prop_oneof![
        3 => (record_id_strategy(), 0..4u8, payload_strategy())
            .prop_map(|(id, user_type, payload)| RecordOp::Add { id, user_type, payload }),
        2 => (record_id_strategy(), 0..4u8, payload_strategy())
            .prop_map(|(id, user_type, payload)| RecordOp::Update { id, user_type, payload }),
        2 => record_id_strategy().prop_map(|id| RecordOp::Delete { id }),
    ]
}

/// Strategy for transaction outcomes.
pub fn tx_outcome_strategy() -> impl Strategy<Value = TxOutcome> {
    prop_oneof![
        4 => Just(TxOutcome::Commit),
        2 => Just(TxOutcome::Rollback),
        1 => Just(TxOutcome::InDoubt),
        1 => Just(TxOutcome::Abandon),
    ]
}

/// Strategy for one workload step.
pub fn journal_op_strategy() -> impl Strategy<Value = JournalOp> {
    prop_oneof![
        5 => record_op_strategy().prop_map(JournalOp::Single),
        1 => (prop::collection::vec(record_op_strategy(), 1..5), tx_outcome_strategy())
            .prop_map(|(ops, outcome)| JournalOp::Transaction { ops, outcome }),
    ]
}

/// Strategy for a workload of `min_ops..max_ops` steps.
pub fn op_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<JournalOp>> {
    prop::collection::vec(journal_op_strategy(), min_ops..max_ops)
}

/// Strategy for paged messages.
pub fn message_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..64)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
