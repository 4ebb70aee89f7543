//! Applying a channel answer to the ledger.
//!
//! The engine (right after a split), the reconciliation sweep (after a
//! query) and the notification handler (after a channel push) all end up
//! here, so a batch settles through one compare-and-swap no matter which path
//! learns the outcome first.

use crate::domain::batch::{BatchState, BatchUpdate, DivisionBatch, RecordOutcome, RecordState};
use crate::domain::channel::{ChannelError, ChannelStatus, SplitResult};
use crate::domain::ports::{DivisionLedgerRef, OrderStoreRef};
use crate::error::{DivisionError, Result};

/// What a settlement attempt did to the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    /// The batch is SUCCESS and the order FINISHED.
    Finished(DivisionBatch),
    /// The batch is FAILED; the order can be divided again.
    Failed(DivisionBatch),
    /// Still no definite answer; the batch waits for reconciliation.
    Pending(DivisionBatch),
    /// Another path settled the batch first; this answer was dropped.
    Superseded(DivisionBatch),
}

impl Settled {
    pub fn batch(&self) -> &DivisionBatch {
        match self {
            Settled::Finished(batch)
            | Settled::Failed(batch)
            | Settled::Pending(batch)
            | Settled::Superseded(batch) => batch,
        }
    }
}

/// Applies `result` to `batch`, provided the batch is still in one of `from`.
pub async fn settle(
    orders: &OrderStoreRef,
    ledger: &DivisionLedgerRef,
    batch: &DivisionBatch,
    from: &[BatchState],
    result: &SplitResult,
) -> Result<Settled> {
    let update = BatchUpdate {
        channel_order_ref: result.channel_order_ref.clone(),
        error: result.error.clone(),
    };

    match result.status {
        ChannelStatus::Success => {
            let settled = match ledger
                .transition_batch(batch.id, from, BatchState::Success, update)
                .await
            {
                Ok(settled) => settled,
                Err(DivisionError::InvalidTransition { .. }) => {
                    let current = current_state(ledger, batch).await?;
                    if current.state == BatchState::Failed {
                        return Err(late_success(&current, result));
                    }
                    return Ok(superseded(current));
                }
                Err(e) => return Err(e),
            };
            complete_success(orders, ledger, &settled, Some(result)).await?;
            tracing::info!(
                order_id = %settled.order_id,
                batch_id = %settled.id,
                channel_order_ref = settled.channel_order_ref.as_deref().unwrap_or(""),
                "division succeeded"
            );
            Ok(Settled::Finished(settled))
        }
        ChannelStatus::Failed => {
            let settled = match ledger
                .transition_batch(batch.id, from, BatchState::Failed, update)
                .await
            {
                Ok(settled) => settled,
                Err(DivisionError::InvalidTransition { .. }) => {
                    return Ok(superseded(current_state(ledger, batch).await?));
                }
                Err(e) => return Err(e),
            };
            let outcomes =
                record_outcomes(ledger, &settled, RecordState::Failed, Some(result)).await?;
            ledger.transition_records(settled.id, &outcomes).await?;
            tracing::warn!(
                order_id = %settled.order_id,
                batch_id = %settled.id,
                code = result.error.as_ref().and_then(|e| e.code.as_deref()).unwrap_or(""),
                "division rejected by channel"
            );
            Ok(Settled::Failed(settled))
        }
        ChannelStatus::Unknown => {
            if batch.state != BatchState::Submitted || !from.contains(&BatchState::Submitted) {
                return Ok(Settled::Pending(batch.clone()));
            }
            match ledger
                .transition_batch(batch.id, &[BatchState::Submitted], BatchState::Unknown, update)
                .await
            {
                Ok(pending) => {
                    tracing::warn!(
                        order_id = %pending.order_id,
                        batch_id = %pending.id,
                        "division outcome unknown, handing over to reconciliation"
                    );
                    Ok(Settled::Pending(pending))
                }
                Err(DivisionError::InvalidTransition { .. }) => {
                    Ok(superseded(current_state(ledger, batch).await?))
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Brings records and the order in line with a batch that is already
/// SUCCESS. Safe to repeat: only pending records move and finishing an order
/// twice is a no-op.
pub async fn complete_success(
    orders: &OrderStoreRef,
    ledger: &DivisionLedgerRef,
    batch: &DivisionBatch,
    result: Option<&SplitResult>,
) -> Result<()> {
    let outcomes = record_outcomes(ledger, batch, RecordState::Success, result).await?;
    ledger.transition_records(batch.id, &outcomes).await?;
    orders.mark_finished(&batch.order_id).await
}

async fn current_state(ledger: &DivisionLedgerRef, batch: &DivisionBatch) -> Result<DivisionBatch> {
    ledger
        .get_batch(batch.id)
        .await?
        .ok_or(DivisionError::BatchNotFound(batch.id))
}

fn superseded(current: DivisionBatch) -> Settled {
    tracing::debug!(
        batch_id = %current.id,
        state = %current.state,
        "batch already settled elsewhere"
    );
    Settled::Superseded(current)
}

/// The channel executed a batch the ledger already failed. The order was
/// reopened on the strength of that failure, so receivers may be paid twice.
fn late_success(current: &DivisionBatch, result: &SplitResult) -> DivisionError {
    tracing::error!(
        order_id = %current.order_id,
        batch_id = %current.id,
        channel_order_ref = result.channel_order_ref.as_deref().unwrap_or(""),
        "channel confirmed a batch recorded as failed, needs manual reconciliation"
    );
    DivisionError::IntegrityViolation(format!(
        "channel confirmed batch {} of order {} after it was recorded as failed",
        current.id, current.order_id
    ))
}

/// One outcome per pending record. Per-receiver errors from the channel are
/// kept; otherwise a failed record carries the batch-level error.
async fn record_outcomes(
    ledger: &DivisionLedgerRef,
    batch: &DivisionBatch,
    state: RecordState,
    result: Option<&SplitResult>,
) -> Result<Vec<RecordOutcome>> {
    let records = ledger.records(batch.id).await?;
    let batch_error: Option<ChannelError> = result.and_then(|r| r.error.clone());
    Ok(records
        .into_iter()
        .filter(|record| record.state == RecordState::Pending)
        .map(|record| {
            let receiver_error = result.and_then(|r| {
                r.per_receiver
                    .iter()
                    .find(|p| p.receiver_id == record.receiver_id)
                    .and_then(|p| p.error.clone())
            });
            let error = match state {
                RecordState::Failed => receiver_error.or_else(|| batch_error.clone()),
                _ => receiver_error,
            };
            RecordOutcome {
                receiver_id: record.receiver_id,
                state,
                error,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::{BatchKind, DivisionRecord};
    use crate::domain::money::Amount;
    use crate::domain::order::DivisionStatus;
    use crate::domain::order::fixtures::order;
    use crate::domain::ports::{DivisionLedger, OrderStore};
    use crate::domain::receiver::ChannelCode;
    use crate::domain::receiver::fixtures::binding;
    use crate::infrastructure::in_memory::InMemoryStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn submitted_batch() -> (OrderStoreRef, DivisionLedgerRef, DivisionBatch) {
        let store = InMemoryStore::new();
        store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
        let (batch, _) = store
            .open_batch("P1", &ChannelCode::new("wxpay"), BatchKind::Split)
            .await
            .unwrap();
        store
            .append_records(
                batch.id,
                vec![
                    DivisionRecord::pending(
                        batch.id,
                        &binding(1, "wxpay", dec!(0.3)),
                        Amount::new(3_000),
                    ),
                    DivisionRecord::pending(
                        batch.id,
                        &binding(2, "wxpay", dec!(0.2)),
                        Amount::new(2_000),
                    ),
                ],
            )
            .await
            .unwrap();
        let batch = store
            .transition_batch(
                batch.id,
                &[BatchState::Init],
                BatchState::Submitted,
                BatchUpdate::default(),
            )
            .await
            .unwrap();
        let orders: OrderStoreRef = Arc::new(store.clone());
        let ledger: DivisionLedgerRef = Arc::new(store);
        (orders, ledger, batch)
    }

    #[tokio::test]
    async fn test_success_finishes_order() {
        let (orders, ledger, batch) = submitted_batch().await;
        let settled = settle(
            &orders,
            &ledger,
            &batch,
            &[BatchState::Submitted],
            &SplitResult::success(Some("REF1".to_string())),
        )
        .await
        .unwrap();

        assert!(matches!(settled, Settled::Finished(_)));
        assert_eq!(settled.batch().channel_order_ref.as_deref(), Some("REF1"));
        let records = ledger.records(batch.id).await.unwrap();
        assert!(records.iter().all(|r| r.state == RecordState::Success));
        let order = orders.get("P1").await.unwrap().unwrap();
        assert_eq!(order.division_status, DivisionStatus::Finished);
    }

    #[tokio::test]
    async fn test_failure_keeps_order_processing() {
        let (orders, ledger, batch) = submitted_batch().await;
        let settled = settle(
            &orders,
            &ledger,
            &batch,
            &[BatchState::Submitted],
            &SplitResult::failed(Some("NOT_ENOUGH"), "insufficient balance"),
        )
        .await
        .unwrap();

        assert!(matches!(settled, Settled::Failed(_)));
        let records = ledger.records(batch.id).await.unwrap();
        assert!(records.iter().all(|r| r.state == RecordState::Failed));
        assert!(records.iter().all(|r| r.error_code.as_deref() == Some("NOT_ENOUGH")));
        let order = orders.get("P1").await.unwrap().unwrap();
        assert_eq!(order.division_status, DivisionStatus::Processing);
    }

    #[tokio::test]
    async fn test_second_answer_is_superseded() {
        let (orders, ledger, batch) = submitted_batch().await;
        let from = [BatchState::Submitted, BatchState::Unknown];
        settle(&orders, &ledger, &batch, &from, &SplitResult::success(None))
            .await
            .unwrap();

        let late = settle(
            &orders,
            &ledger,
            &batch,
            &from,
            &SplitResult::failed(Some("ORDER_NOT_EXIST"), "late"),
        )
        .await
        .unwrap();
        assert!(matches!(late, Settled::Superseded(_)));
        assert_eq!(late.batch().state, BatchState::Success);
    }

    #[tokio::test]
    async fn test_success_after_failure_is_integrity_violation() {
        let (orders, ledger, batch) = submitted_batch().await;
        let from = [BatchState::Submitted, BatchState::Unknown];
        settle(
            &orders,
            &ledger,
            &batch,
            &from,
            &SplitResult::failed(Some("ORDER_NOT_EXIST"), "not found"),
        )
        .await
        .unwrap();

        let success = SplitResult::success(Some("REF1".to_string()));
        let late = settle(&orders, &ledger, &batch, &from, &success).await;
        let error = late.unwrap_err();
        assert!(matches!(error, DivisionError::IntegrityViolation(_)));
        assert_eq!(error.kind(), crate::error::ErrorKind::Integrity);

        let current = ledger.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(current.state, BatchState::Failed);
    }

    #[tokio::test]
    async fn test_unknown_moves_submitted_to_unknown_once() {
        let (orders, ledger, batch) = submitted_batch().await;
        let from = [BatchState::Submitted, BatchState::Unknown];
        let settled = settle(&orders, &ledger, &batch, &from, &SplitResult::unknown("timeout"))
            .await
            .unwrap();
        assert!(matches!(settled, Settled::Pending(_)));
        assert_eq!(settled.batch().state, BatchState::Unknown);

        let again = settle(
            &orders,
            &ledger,
            settled.batch(),
            &from,
            &SplitResult::unknown("timeout"),
        )
        .await
        .unwrap();
        assert!(matches!(again, Settled::Pending(_)));
        assert_eq!(again.batch().state, BatchState::Unknown);
    }
}
