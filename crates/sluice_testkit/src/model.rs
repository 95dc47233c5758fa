//! A reference model of the journal's live set.
//!
//! [`drive`] applies a workload step to a journal and, one record at a
//! time, to the model. The model only changes after the journal accepted
//! the record, so after a simulated crash it describes exactly what the
//! recovered journal must contain.

use crate::generators::{JournalOp, RecordOp, TxOutcome};
use sluice_journal::{Journal, JournalResult, LoadedJournal, OpKind, Record, TransactionId};
use std::collections::{BTreeMap, BTreeSet};

/// The value of a live record: user type and payload.
pub type LiveValue = (u8, Vec<u8>);

/// Expected journal state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceModel {
    live: BTreeMap<u64, LiveValue>,
    in_doubt: BTreeSet<TransactionId>,
    next_tx: u64,
}

impl ReferenceModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the expected live records.
    #[must_use]
    pub fn live(&self) -> &BTreeMap<u64, LiveValue> {
        &self.live
    }

    /// Returns the transactions expected in doubt after a restart.
    #[must_use]
    pub fn in_doubt(&self) -> &BTreeSet<TransactionId> {
        &self.in_doubt
    }

    fn apply(&mut self, op: &RecordOp) {
        match op {
            RecordOp::Add {
                id,
                user_type,
                payload,
            }
            | RecordOp::Update {
                id,
                user_type,
                payload,
            } => {
                self.live.insert(*id, (*user_type, payload.clone()));
            }
            RecordOp::Delete { id } => {
                self.live.remove(id);
            }
        }
    }
}

fn as_append(op: &RecordOp) -> (OpKind, Record) {
    match op {
        RecordOp::Add {
            id,
            user_type,
            payload,
        } => (OpKind::Add, Record::new(*id, *user_type, payload.clone())),
        RecordOp::Update {
            id,
            user_type,
            payload,
        } => (OpKind::Update, Record::new(*id, *user_type, payload.clone())),
        RecordOp::Delete { id } => (OpKind::Delete, Record::new(*id, 0, Vec::new())),
    }
}

/// Applies one workload step to `journal` and `model`.
///
/// # Errors
///
/// Returns the first journal error; the model reflects every record the
/// journal accepted before it.
pub fn drive(journal: &Journal, model: &mut ReferenceModel, op: &JournalOp) -> JournalResult<()> {
    match op {
        JournalOp::Single(op) => {
            let (kind, record) = as_append(op);
            journal.append(kind, record)?;
            model.apply(op);
        }
        JournalOp::Transaction { ops, outcome } => {
            model.next_tx += 1;
            let tx_id = TransactionId::new(model.next_tx);
            for op in ops {
                let (kind, record) = as_append(op);
                journal.append(kind, record.in_tx(tx_id))?;
            }
            if *outcome == TxOutcome::Abandon {
                return Ok(());
            }

            journal.prepare(tx_id, tx_id.as_u64().to_le_bytes().to_vec())?;
            model.in_doubt.insert(tx_id);
            match outcome {
                TxOutcome::Commit => {
                    journal.commit(tx_id)?;
                    model.in_doubt.remove(&tx_id);
                    ops.iter().for_each(|op| model.apply(op));
                }
                TxOutcome::Rollback => {
                    journal.rollback(tx_id)?;
                    model.in_doubt.remove(&tx_id);
                }
                TxOutcome::InDoubt | TxOutcome::Abandon => {}
            }
        }
    }
    Ok(())
}

/// Applies a whole workload, stopping at the first error.
///
/// # Errors
///
/// Returns the first journal error.
pub fn drive_all(
    journal: &Journal,
    model: &mut ReferenceModel,
    ops: &[JournalOp],
) -> JournalResult<()> {
    ops.iter().try_for_each(|op| drive(journal, model, op))
}

/// Returns the recovered live set in model form.
#[must_use]
pub fn live_values(loaded: &LoadedJournal) -> BTreeMap<u64, LiveValue> {
    loaded
        .records
        .iter()
        .map(|record| (record.id, (record.user_type, record.payload.clone())))
        .collect()
}

/// Returns the recovered in-doubt transaction ids.
#[must_use]
pub fn in_doubt_ids(loaded: &LoadedJournal) -> BTreeSet<TransactionId> {
    loaded.in_doubt.iter().map(|tx| tx.tx_id).collect()
}
