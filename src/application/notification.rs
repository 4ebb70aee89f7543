use super::settlement::{Settled, settle};
use crate::domain::batch::{BatchId, BatchState};
use crate::domain::channel::{ChannelError, ChannelStatus, ReceiverResult, SplitResult};
use crate::domain::ports::{DivisionLedgerRef, OrderStoreRef};
use crate::domain::receiver::ChannelCode;
use crate::error::{DivisionError, Result};
use serde::{Deserialize, Serialize};

/// A division result pushed by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelNotification {
    pub batch_id: BatchId,
    pub channel: ChannelCode,
    pub status: ChannelStatus,
    #[serde(default)]
    pub channel_order_ref: Option<String>,
    #[serde(default)]
    pub per_receiver: Vec<ReceiverResult>,
    #[serde(default)]
    pub error: Option<ChannelError>,
}

impl From<&ChannelNotification> for SplitResult {
    fn from(notification: &ChannelNotification) -> Self {
        SplitResult {
            status: notification.status,
            channel_order_ref: notification.channel_order_ref.clone(),
            per_receiver: notification.per_receiver.clone(),
            error: notification.error.clone(),
        }
    }
}

/// Applies channel pushes through the same settlement path as reconciliation
/// queries, so a push racing a sweep settles the batch only once.
pub struct NotificationHandler {
    orders: OrderStoreRef,
    ledger: DivisionLedgerRef,
}

impl NotificationHandler {
    pub fn new(orders: OrderStoreRef, ledger: DivisionLedgerRef) -> Self {
        Self { orders, ledger }
    }

    pub async fn handle(&self, notification: &ChannelNotification) -> Result<Settled> {
        let batch = self
            .ledger
            .get_batch(notification.batch_id)
            .await?
            .ok_or(DivisionError::BatchNotFound(notification.batch_id))?;
        if batch.channel != notification.channel {
            return Err(DivisionError::IntegrityViolation(format!(
                "notification from {} for batch {} opened on {}",
                notification.channel, batch.id, batch.channel
            )));
        }

        tracing::info!(
            batch_id = %batch.id,
            order_id = %batch.order_id,
            status = ?notification.status,
            "channel notification received"
        );
        // A push is the channel's own answer, so it may also close a batch
        // that reconciliation already gave up on.
        let from = [
            BatchState::Submitted,
            BatchState::Unknown,
            BatchState::ManualReview,
        ];
        settle(&self.orders, &self.ledger, &batch, &from, &notification.into()).await
    }

    /// Parses a JSON payload and handles it.
    pub async fn handle_json(&self, payload: &str) -> Result<Settled> {
        let notification: ChannelNotification = serde_json::from_str(payload)?;
        self.handle(&notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::{BatchKind, BatchUpdate, DivisionBatch};
    use crate::domain::order::DivisionStatus;
    use crate::domain::order::fixtures::order;
    use crate::domain::ports::{DivisionLedger, OrderStore};
    use crate::infrastructure::in_memory::InMemoryStore;
    use std::sync::Arc;

    async fn submitted(store: &InMemoryStore) -> DivisionBatch {
        store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
        let (batch, _) = store
            .open_batch("P1", &ChannelCode::new("wxpay"), BatchKind::Split)
            .await
            .unwrap();
        store
            .transition_batch(
                batch.id,
                &[BatchState::Init],
                BatchState::Submitted,
                BatchUpdate::default(),
            )
            .await
            .unwrap()
    }

    fn handler(store: &InMemoryStore) -> NotificationHandler {
        NotificationHandler::new(Arc::new(store.clone()), Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_push_settles_batch_once() {
        let store = InMemoryStore::new();
        let batch = submitted(&store).await;
        let handler = handler(&store);

        let payload = format!(
            r#"{{"batch_id":"{}","channel":"wxpay","status":"success","channel_order_ref":"WX-1"}}"#,
            batch.id
        );
        let first = handler.handle_json(&payload).await.unwrap();
        assert!(matches!(first, Settled::Finished(_)));
        let order = OrderStore::get(&store, "P1").await.unwrap().unwrap();
        assert_eq!(order.division_status, DivisionStatus::Finished);

        // Channels retry pushes; a duplicate or contradicting one changes nothing.
        let late = ChannelNotification {
            batch_id: batch.id,
            channel: ChannelCode::new("wxpay"),
            status: ChannelStatus::Failed,
            channel_order_ref: None,
            per_receiver: Vec::new(),
            error: None,
        };
        let second = handler.handle(&late).await.unwrap();
        assert!(matches!(second, Settled::Superseded(_)));
        assert_eq!(second.batch().state, BatchState::Success);
    }

    #[tokio::test]
    async fn test_channel_mismatch_rejected() {
        let store = InMemoryStore::new();
        let batch = submitted(&store).await;
        let notification = ChannelNotification {
            batch_id: batch.id,
            channel: ChannelCode::new("alipay"),
            status: ChannelStatus::Success,
            channel_order_ref: None,
            per_receiver: Vec::new(),
            error: None,
        };
        let result = handler(&store).handle(&notification).await;
        assert!(matches!(result, Err(DivisionError::IntegrityViolation(_))));
    }

    #[tokio::test]
    async fn test_unknown_batch_and_bad_payload() {
        let store = InMemoryStore::new();
        let handler = handler(&store);
        let notification = ChannelNotification {
            batch_id: BatchId::generate(),
            channel: ChannelCode::new("wxpay"),
            status: ChannelStatus::Success,
            channel_order_ref: None,
            per_receiver: Vec::new(),
            error: None,
        };
        assert!(matches!(
            handler.handle(&notification).await,
            Err(DivisionError::BatchNotFound(_))
        ));
        assert!(matches!(
            handler.handle_json("{not json").await,
            Err(DivisionError::SerializationError(_))
        ));
    }
}
