//! Storage backends, the receiver registry, and channel adapters.

pub mod channels;
pub mod in_memory;
pub mod registry;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

use crate::domain::batch::{
    BatchId, BatchState, DivisionBatch, DivisionRecord, RecordOutcome, RecordState,
};
use crate::domain::order::{DivisionStatus, Order};
use crate::error::{DivisionError, Result};

/// The open-batch decision shared by every ledger backend.
///
/// Returns the batch that blocks a new attempt for the order, if any. The
/// caller must hold whatever makes the read-decide-write sequence atomic.
pub(crate) fn blocking_batch<'a>(
    order_id: &str,
    order: Option<&Order>,
    batches: impl IntoIterator<Item = &'a DivisionBatch>,
) -> Result<Option<&'a DivisionBatch>> {
    let order = order.ok_or_else(|| DivisionError::OrderNotFound(order_id.to_string()))?;
    if order.division_status == DivisionStatus::Finished {
        return Err(order.not_eligible("division already finished"));
    }
    Ok(batches
        .into_iter()
        .filter(|b| b.state.blocks_new_attempt())
        .max_by_key(|b| b.id))
}

pub(crate) fn invalid_transition(
    batch_id: BatchId,
    from: BatchState,
    to: BatchState,
) -> DivisionError {
    DivisionError::InvalidTransition { batch_id, from, to }
}

/// Applies an outcome to a record that is still pending.
pub(crate) fn apply_record_outcome(record: &mut DivisionRecord, outcome: &RecordOutcome) -> bool {
    if record.state != RecordState::Pending {
        return false;
    }
    record.state = outcome.state;
    if let Some(error) = &outcome.error {
        record.error_code = error.code.clone();
        record.error_message = error.message.clone();
    }
    true
}
