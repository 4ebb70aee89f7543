use crate::domain::batch::{BatchId, DivisionBatch, DivisionRecord};
use crate::domain::channel::{
    BindResult, CredentialContext, FinalizeResult, Idempotency, SplitResult,
};
use crate::domain::order::Order;
use crate::domain::ports::{ChannelAdapter, ChannelAdapterRef};
use crate::domain::receiver::{ChannelCode, ReceiverBinding};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Entries kept per operation before the oldest batch ids are evicted.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Clone)]
enum Call {
    InFlight,
    Done(SplitResult),
}

/// Engine-side guard for channels that do not deduplicate writes natively.
///
/// A batch id is forwarded to the channel at most once per operation. Later
/// calls get the recorded result, or UNKNOWN while the first call is still in
/// flight or was abandoned mid-way. Queries and binds pass straight through.
pub struct DedupAdapter {
    inner: ChannelAdapterRef,
    capacity: usize,
    splits: Mutex<BTreeMap<BatchId, Call>>,
    finalizes: Mutex<BTreeMap<BatchId, Call>>,
}

impl DedupAdapter {
    pub fn new(inner: ChannelAdapterRef) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: ChannelAdapterRef, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            splits: Mutex::new(BTreeMap::new()),
            finalizes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Claims `batch_id` in `calls`. Returns the earlier answer if someone
    /// already claimed it.
    async fn claim(
        &self,
        calls: &Mutex<BTreeMap<BatchId, Call>>,
        batch_id: BatchId,
    ) -> Option<SplitResult> {
        let mut calls = calls.lock().await;
        match calls.get(&batch_id) {
            Some(Call::Done(result)) => Some(result.clone()),
            Some(Call::InFlight) => Some(SplitResult::unknown(
                "an earlier request for this batch has not been confirmed",
            )),
            None => {
                calls.insert(batch_id, Call::InFlight);
                // Batch ids are time-ordered, so the first key is the oldest.
                while calls.len() > self.capacity {
                    calls.pop_first();
                }
                None
            }
        }
    }

    async fn settle(
        &self,
        calls: &Mutex<BTreeMap<BatchId, Call>>,
        batch_id: BatchId,
        result: &SplitResult,
    ) {
        calls
            .lock()
            .await
            .insert(batch_id, Call::Done(result.clone()));
    }
}

#[async_trait]
impl ChannelAdapter for DedupAdapter {
    fn channel(&self) -> &ChannelCode {
        self.inner.channel()
    }

    fn supports_division(&self) -> bool {
        self.inner.supports_division()
    }

    /// The wrapped channel's own guarantees. Repeating a write through this
    /// guard only replays the cached answer, so callers that need the
    /// channel's real status must query it.
    fn idempotency(&self) -> Idempotency {
        self.inner.idempotency()
    }

    async fn bind(&self, binding: &ReceiverBinding, credentials: &CredentialContext) -> BindResult {
        self.inner.bind(binding, credentials).await
    }

    async fn split(
        &self,
        order: &Order,
        batch: &DivisionBatch,
        records: &[DivisionRecord],
    ) -> SplitResult {
        if !self.inner.idempotency().split
            && let Some(previous) = self.claim(&self.splits, batch.id).await
        {
            tracing::debug!(batch_id = %batch.id, "suppressed duplicate split");
            return previous;
        }
        let result = self.inner.split(order, batch, records).await;
        if !self.inner.idempotency().split {
            self.settle(&self.splits, batch.id, &result).await;
        }
        result
    }

    async fn query(&self, order: &Order, batch: &DivisionBatch) -> SplitResult {
        self.inner.query(order, batch).await
    }

    async fn finalize(&self, order: &Order, batch: &DivisionBatch) -> FinalizeResult {
        if !self.inner.idempotency().finalize
            && let Some(previous) = self.claim(&self.finalizes, batch.id).await
        {
            tracing::debug!(batch_id = %batch.id, "suppressed duplicate finalize");
            return previous;
        }
        let result = self.inner.finalize(order, batch).await;
        if !self.inner.idempotency().finalize {
            self.settle(&self.finalizes, batch.id, &result).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::BatchKind;
    use crate::domain::channel::ChannelStatus;
    use crate::domain::money::Amount;
    use crate::domain::order::fixtures::order;
    use crate::domain::receiver::fixtures::binding;
    use crate::infrastructure::channels::{SandboxChannel, SandboxConfig, SandboxReply};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    fn non_idempotent_sandbox() -> Arc<SandboxChannel> {
        let mut config = SandboxConfig::new("wxpay");
        config.native_idempotency = false;
        Arc::new(SandboxChannel::new(config))
    }

    #[tokio::test]
    async fn test_split_forwarded_once_per_batch() {
        let sandbox = non_idempotent_sandbox();
        let guard = DedupAdapter::new(sandbox.clone());
        let order = order("P1", "wxpay", 10_000);
        let batch = DivisionBatch::new("P1", order.channel.clone(), BatchKind::Split, Utc::now());
        let records = vec![DivisionRecord::pending(
            batch.id,
            &binding(1, "wxpay", dec!(0.3)),
            Amount::new(3_000),
        )];

        let first = guard.split(&order, &batch, &records).await;
        let second = guard.split(&order, &batch, &records).await;

        assert_eq!(first.status, ChannelStatus::Success);
        assert_eq!(first, second);
        assert_eq!(sandbox.split_calls(), 1);
        assert_eq!(sandbox.credited(1).await, Amount::new(3_000));
        assert_eq!(guard.idempotency(), Idempotency::QUERY_ONLY);
    }

    #[tokio::test]
    async fn test_abandoned_call_is_never_resent() {
        let sandbox = non_idempotent_sandbox();
        sandbox.push_split_reply(SandboxReply::Hang).await;
        let guard = DedupAdapter::new(sandbox.clone());
        let order = order("P1", "wxpay", 10_000);
        let batch = DivisionBatch::new("P1", order.channel.clone(), BatchKind::Split, Utc::now());
        let records = vec![DivisionRecord::pending(
            batch.id,
            &binding(1, "wxpay", dec!(0.3)),
            Amount::new(3_000),
        )];

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), guard.split(&order, &batch, &records))
                .await;
        assert!(timed_out.is_err());

        let retry = guard.split(&order, &batch, &records).await;
        assert_eq!(retry.status, ChannelStatus::Unknown);
        assert_eq!(sandbox.split_calls(), 1);
        assert_eq!(sandbox.credited(1).await, Amount::new(3_000));
    }

    #[tokio::test]
    async fn test_oldest_entries_evicted() {
        let sandbox = non_idempotent_sandbox();
        let guard = DedupAdapter::with_capacity(sandbox.clone(), 2);
        let order = order("P1", "wxpay", 10_000);
        let batches: Vec<_> = (0..3)
            .map(|_| {
                DivisionBatch::new("P1", order.channel.clone(), BatchKind::Finalize, Utc::now())
            })
            .collect();
        for batch in &batches {
            guard.finalize(&order, batch).await;
        }
        assert_eq!(guard.finalizes.lock().await.len(), 2);
        assert!(!guard.finalizes.lock().await.contains_key(&batches[0].id));
    }
}
