use super::{apply_record_outcome, blocking_batch, invalid_transition};
use crate::domain::batch::{
    BatchId, BatchKind, BatchState, BatchUpdate, DivisionBatch, DivisionRecord, RecordOutcome,
    StuckQuery,
};
use crate::domain::order::{DivisionStatus, Order};
use crate::domain::ports::{DivisionLedger, OrderStore};
use crate::domain::receiver::ChannelCode;
use crate::error::{DivisionError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct LedgerState {
    orders: HashMap<String, Order>,
    batches: BTreeMap<BatchId, DivisionBatch>,
    order_batches: HashMap<String, Vec<BatchId>>,
    records: BTreeMap<(BatchId, u64), DivisionRecord>,
}

/// A thread-safe in-memory order store and division ledger.
///
/// Orders, batches and records share one `RwLock`, so the open-batch
/// compare-and-swap on an order's division status is a single critical
/// section. Cloning shares the underlying state.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert(&self, order: Order) -> Result<()> {
        let mut state = self.state.write().await;
        // Re-importing an order must not reset a division already underway.
        let status = state
            .orders
            .get(&order.id)
            .map(|existing| existing.division_status)
            .unwrap_or(order.division_status);
        state.orders.insert(
            order.id.clone(),
            Order {
                division_status: status,
                ..order
            },
        );
        Ok(())
    }

    async fn get(&self, order_id: &str) -> Result<Option<Order>> {
        let state = self.state.read().await;
        Ok(state.orders.get(order_id).cloned())
    }

    async fn mark_finished(&self, order_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| DivisionError::OrderNotFound(order_id.to_string()))?;
        order.division_status = DivisionStatus::Finished;
        Ok(())
    }
}

#[async_trait]
impl DivisionLedger for InMemoryStore {
    async fn open_batch(
        &self,
        order_id: &str,
        channel: &ChannelCode,
        kind: BatchKind,
    ) -> Result<(DivisionBatch, bool)> {
        let mut state = self.state.write().await;
        let LedgerState {
            orders,
            batches,
            order_batches,
            ..
        } = &mut *state;

        let existing = order_batches
            .get(order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| batches.get(id));
        if let Some(batch) = blocking_batch(order_id, orders.get(order_id), existing)? {
            return Ok((batch.clone(), false));
        }

        let batch = DivisionBatch::new(order_id, channel.clone(), kind, Utc::now());
        if let Some(order) = orders.get_mut(order_id) {
            order.division_status = DivisionStatus::Processing;
        }
        order_batches
            .entry(order_id.to_string())
            .or_default()
            .push(batch.id);
        batches.insert(batch.id, batch.clone());
        Ok((batch, true))
    }

    async fn append_records(&self, batch_id: BatchId, records: Vec<DivisionRecord>) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.batches.contains_key(&batch_id) {
            return Err(DivisionError::BatchNotFound(batch_id));
        }
        for record in records {
            state.records.insert((batch_id, record.receiver_id), record);
        }
        Ok(())
    }

    async fn transition_batch(
        &self,
        batch_id: BatchId,
        from: &[BatchState],
        to: BatchState,
        update: BatchUpdate,
    ) -> Result<DivisionBatch> {
        let mut state = self.state.write().await;
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or(DivisionError::BatchNotFound(batch_id))?;
        if !from.contains(&batch.state) {
            return Err(invalid_transition(batch_id, batch.state, to));
        }
        batch
            .apply(to, update, Utc::now())
            .map_err(|(from, to)| invalid_transition(batch_id, from, to))?;
        Ok(batch.clone())
    }

    async fn transition_records(
        &self,
        batch_id: BatchId,
        outcomes: &[RecordOutcome],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        for outcome in outcomes {
            if let Some(record) = state.records.get_mut(&(batch_id, outcome.receiver_id)) {
                apply_record_outcome(record, outcome);
            }
        }
        Ok(())
    }

    async fn record_attempt(&self, batch_id: BatchId) -> Result<DivisionBatch> {
        let mut state = self.state.write().await;
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or(DivisionError::BatchNotFound(batch_id))?;
        batch.attempts += 1;
        batch.updated_at = Utc::now();
        Ok(batch.clone())
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<DivisionBatch>> {
        let state = self.state.read().await;
        Ok(state.batches.get(&batch_id).cloned())
    }

    async fn records(&self, batch_id: BatchId) -> Result<Vec<DivisionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .range((batch_id, u64::MIN)..=(batch_id, u64::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn batches_for_order(&self, order_id: &str) -> Result<Vec<DivisionBatch>> {
        let state = self.state.read().await;
        Ok(state
            .order_batches
            .get(order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.batches.get(id).cloned())
            .collect())
    }

    async fn list_stuck(&self, query: &StuckQuery) -> Result<Vec<DivisionBatch>> {
        let state = self.state.read().await;
        let lower = match query.after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        Ok(state
            .batches
            .range((lower, Bound::Unbounded))
            .map(|(_, batch)| batch)
            .filter(|batch| query.matches(batch))
            .take(query.limit)
            .cloned()
            .collect())
    }
}
