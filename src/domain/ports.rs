use super::batch::{
    BatchId, BatchKind, BatchState, BatchUpdate, DivisionBatch, DivisionRecord, RecordOutcome,
    StuckQuery,
};
use super::channel::{BindResult, CredentialContext, FinalizeResult, Idempotency, SplitResult};
use super::order::Order;
use super::receiver::{ChannelCode, ReceiverBinding};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Read/finish access to captured orders.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: Order) -> Result<()>;
    async fn get(&self, order_id: &str) -> Result<Option<Order>>;
    /// Marks the order's division as finished. Calling it twice is a no-op.
    async fn mark_finished(&self, order_id: &str) -> Result<()>;
}

/// Durable division state: batches, their records, and the order status
/// compare-and-swap that serializes attempts per order.
#[async_trait]
pub trait DivisionLedger: Send + Sync {
    /// Returns the batch currently blocking new attempts for the order
    /// (`created = false`), or moves the order to PROCESSING and creates a
    /// fresh INIT batch (`created = true`). Atomic per order.
    async fn open_batch(
        &self,
        order_id: &str,
        channel: &ChannelCode,
        kind: BatchKind,
    ) -> Result<(DivisionBatch, bool)>;

    /// Stores records for a batch. Re-appending the same receiver replaces it.
    async fn append_records(&self, batch_id: BatchId, records: Vec<DivisionRecord>) -> Result<()>;

    /// Compare-and-swap on the batch state. Fails with `InvalidTransition`
    /// when the current state is not in `from` or the edge is illegal.
    async fn transition_batch(
        &self,
        batch_id: BatchId,
        from: &[BatchState],
        to: BatchState,
        update: BatchUpdate,
    ) -> Result<DivisionBatch>;

    /// Moves PENDING records to their final state. Records already final are
    /// left untouched.
    async fn transition_records(&self, batch_id: BatchId, outcomes: &[RecordOutcome])
    -> Result<()>;

    /// Counts an inconclusive reconciliation query and refreshes `updated_at`.
    async fn record_attempt(&self, batch_id: BatchId) -> Result<DivisionBatch>;

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<DivisionBatch>>;
    async fn records(&self, batch_id: BatchId) -> Result<Vec<DivisionRecord>>;
    async fn batches_for_order(&self, order_id: &str) -> Result<Vec<DivisionBatch>>;

    /// One page of batches matching `query`, ordered by batch id.
    async fn list_stuck(&self, query: &StuckQuery) -> Result<Vec<DivisionBatch>>;
}

/// Validated receiver bindings, consumed read-only.
#[async_trait]
pub trait ReceiverRegistry: Send + Sync {
    /// Active bindings for the merchant app on one channel, in priority order.
    async fn list_active_bindings(
        &self,
        merchant_id: &str,
        app_id: &str,
        channel: &ChannelCode,
    ) -> Result<Vec<ReceiverBinding>>;
}

/// Uniform contract over an external payment channel's division API.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> &ChannelCode;

    /// Whether the channel offers division for this integration at all.
    fn supports_division(&self) -> bool {
        true
    }

    fn idempotency(&self) -> Idempotency;

    async fn bind(&self, binding: &ReceiverBinding, credentials: &CredentialContext)
    -> BindResult;

    async fn split(
        &self,
        order: &Order,
        batch: &DivisionBatch,
        records: &[DivisionRecord],
    ) -> SplitResult;

    /// Re-checks a previously submitted batch. Must not move funds.
    async fn query(&self, order: &Order, batch: &DivisionBatch) -> SplitResult;

    /// Closes the order's division when nothing is owed to receivers.
    async fn finalize(&self, order: &Order, batch: &DivisionBatch) -> FinalizeResult;
}

pub type OrderStoreRef = Arc<dyn OrderStore>;
pub type DivisionLedgerRef = Arc<dyn DivisionLedger>;
pub type ReceiverRegistryRef = Arc<dyn ReceiverRegistry>;
pub type ChannelAdapterRef = Arc<dyn ChannelAdapter>;
