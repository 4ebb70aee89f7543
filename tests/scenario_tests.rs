use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use paysplit::application::adapters::ChannelAdapters;
use paysplit::application::engine::{DivideOptions, DivideStatus, DivisionEngine};
use paysplit::application::notification::NotificationHandler;
use paysplit::application::reconciler::ReconciliationScheduler;
use paysplit::application::settlement::Settled;
use paysplit::config::{EngineConfig, ReconcileConfig};
use paysplit::domain::batch::{BatchKind, BatchState, DivisionBatch, DivisionRecord, RecordState};
use paysplit::domain::channel::{
    BindResult, CredentialContext, FinalizeResult, Idempotency, SplitResult,
};
use paysplit::domain::money::Amount;
use paysplit::domain::order::{DivisionStatus, Order};
use paysplit::domain::ports::{ChannelAdapter, DivisionLedger, OrderStore};
use paysplit::domain::receiver::{ChannelCode, ReceiverBinding};
use paysplit::error::{DivisionError, ErrorKind};
use paysplit::infrastructure::channels::{FinalizeMode, SandboxChannel, SandboxConfig, SandboxReply};
use paysplit::infrastructure::in_memory::InMemoryStore;
use paysplit::infrastructure::registry::InMemoryReceiverRegistry;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{Harness, binding, order};

/// Holds every split back for `delay` before it reaches the sandbox.
struct SlowSplit {
    inner: Arc<SandboxChannel>,
    delay: Duration,
}

#[async_trait]
impl ChannelAdapter for SlowSplit {
    fn channel(&self) -> &ChannelCode {
        self.inner.channel()
    }

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
        tokio::time::sleep(self.delay).await;
        self.inner.split(order, batch, records).await
    }

    async fn query(&self, order: &Order, batch: &DivisionBatch) -> SplitResult {
        self.inner.query(order, batch).await
    }

    async fn finalize(&self, order: &Order, batch: &DivisionBatch) -> FinalizeResult {
        self.inner.finalize(order, batch).await
    }
}

#[tokio::test]
async fn test_two_receivers_keep_remainder() {
    let h = Harness::wxpay();
    h.store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
    h.registry.upsert(binding(1, "wxpay", dec!(0.30))).await.unwrap();
    h.registry.upsert(binding(2, "wxpay", dec!(0.20))).await.unwrap();

    let outcome = h
        .engine
        .divide_order("P1", &DivideOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, DivideStatus::Succeeded);
    assert_eq!(outcome.batch.state, BatchState::Success);

    let history = h.engine.history("P1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].allocated(), Amount::new(5_000));
    assert_eq!(h.sandbox.credited(1).await, Amount::new(3_000));
    assert_eq!(h.sandbox.credited(2).await, Amount::new(2_000));

    let order = OrderStore::get(&h.store, "P1").await.unwrap().unwrap();
    assert_eq!(order.division_status, DivisionStatus::Finished);
}

#[tokio::test]
async fn test_no_receivers_finalize_without_records() {
    for mode in [FinalizeMode::Explicit, FinalizeMode::NoOp] {
        let mut sandbox = SandboxConfig::new("wxpay");
        sandbox.finalize_mode = mode;
        let h = Harness::new(sandbox, 5_000);
        h.store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
        // Suspended receivers do not count.
        h.registry.upsert(binding(1, "wxpay", dec!(0.3))).await.unwrap();
        h.registry.suspend(1).await.unwrap();

        let outcome = h
            .engine
            .divide_order("P1", &DivideOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, DivideStatus::Finalized);
        assert_eq!(outcome.batch.kind, BatchKind::Finalize);
        assert!(h.store.records(outcome.batch.id).await.unwrap().is_empty());
        assert_eq!(h.sandbox.split_calls(), 0);

        let order = OrderStore::get(&h.store, "P1").await.unwrap().unwrap();
        assert_eq!(order.division_status, DivisionStatus::Finished);
    }
}

#[tokio::test]
async fn test_timeout_then_query_failed_allows_fresh_batch() {
    let h = Harness::new(SandboxConfig::new("wxpay"), 30);
    h.store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
    h.registry.upsert(binding(1, "wxpay", dec!(0.5))).await.unwrap();
    h.sandbox.push_split_reply(SandboxReply::Hang).await;
    h.sandbox
        .push_query_reply(SandboxReply::failed("ORDER_NOT_EXIST", "no such division"))
        .await;

    let first = h
        .engine
        .divide_order("P1", &DivideOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, DivideStatus::Pending);
    assert_eq!(first.error_kind, Some(ErrorKind::TransientChannel));
    assert_eq!(first.batch.state, BatchState::Unknown);

    let report = h
        .scheduler
        .sweep_once(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let failed = h.store.get_batch(first.batch.id).await.unwrap().unwrap();
    assert_eq!(failed.state, BatchState::Failed);
    let records = h.store.records(failed.id).await.unwrap();
    assert!(records.iter().all(|r| r.state == RecordState::Failed));
    let order = OrderStore::get(&h.store, "P1").await.unwrap().unwrap();
    assert_eq!(order.division_status, DivisionStatus::Processing);

    let second = h
        .engine
        .divide_order("P1", &DivideOptions::default())
        .await
        .unwrap();
    assert_eq!(second.status, DivideStatus::Succeeded);
    assert_ne!(second.batch.id, first.batch.id);
    assert_eq!(h.engine.history("P1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_timeout_then_query_success_finishes_once() {
    let h = Harness::new(SandboxConfig::new("wxpay"), 30);
    h.store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
    h.registry.upsert(binding(1, "wxpay", dec!(0.3))).await.unwrap();
    h.sandbox.push_split_reply(SandboxReply::Hang).await;

    let outcome = h
        .engine
        .divide_order("P1", &DivideOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, DivideStatus::Pending);

    // The hung request still landed; the query finds it.
    let later = Utc::now() + TimeDelta::seconds(1);
    let report = h.scheduler.sweep_once(later).await.unwrap();
    assert_eq!(report.succeeded, 1);
    let report = h.scheduler.sweep_once(later).await.unwrap();
    assert_eq!(report.scanned, 0);

    let batch = h.store.get_batch(outcome.batch.id).await.unwrap().unwrap();
    assert_eq!(batch.state, BatchState::Success);
    assert_eq!(h.sandbox.split_calls(), 1);
    assert_eq!(h.sandbox.credited(1).await, Amount::new(3_000));

    let result = h.engine.divide_order("P1", &DivideOptions::default()).await;
    assert!(matches!(result, Err(DivisionError::OrderNotEligible { .. })));
}

#[tokio::test]
async fn test_concurrent_calls_open_one_batch() {
    let h = Harness::new(SandboxConfig::new("wxpay"), 200);
    h.store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
    h.registry.upsert(binding(1, "wxpay", dec!(0.3))).await.unwrap();
    // Hold the first request open long enough for the second worker to arrive.
    h.sandbox.push_split_reply(SandboxReply::Hang).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.divide_order("P1", &DivideOptions::default()).await
        }));
    }
    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap().unwrap().status);
    }
    statuses.sort_by_key(|s| s.as_str());

    assert_eq!(statuses, vec![DivideStatus::InProgress, DivideStatus::Pending]);
    assert_eq!(h.store.batches_for_order("P1").await.unwrap().len(), 1);
    assert_eq!(h.sandbox.split_calls(), 1);
}

#[tokio::test]
async fn test_many_workers_credit_receivers_once() {
    let h = Harness::wxpay();
    h.store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
    h.registry.upsert(binding(1, "wxpay", dec!(0.3))).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.divide_order("P1", &DivideOptions::default()).await
        }));
    }
    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) if outcome.status == DivideStatus::Succeeded => succeeded += 1,
            Ok(outcome) => assert!(matches!(
                outcome.status,
                DivideStatus::InProgress | DivideStatus::AlreadyFinished
            )),
            Err(e) => assert!(matches!(e, DivisionError::OrderNotEligible { .. })),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(h.store.batches_for_order("P1").await.unwrap().len(), 1);
    assert_eq!(h.sandbox.credited(1).await, Amount::new(3_000));
}

#[tokio::test]
async fn test_notification_races_reconciliation() {
    let mut sandbox = SandboxConfig::new("wxpay");
    sandbox.confirm_later = true;
    let h = Harness::new(sandbox, 5_000);
    h.store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
    h.registry.upsert(binding(1, "wxpay", dec!(0.3))).await.unwrap();

    let outcome = h
        .engine
        .divide_order("P1", &DivideOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, DivideStatus::Pending);

    let handler = NotificationHandler::new(Arc::new(h.store.clone()), Arc::new(h.store.clone()));
    let payload = serde_json::json!({
        "batch_id": outcome.batch.id,
        "channel": "wxpay",
        "status": "success",
        "channel_order_ref": "wxpay-DIV-1",
    })
    .to_string();
    let settled = handler.handle_json(&payload).await.unwrap();
    assert!(matches!(settled, Settled::Finished(_)));

    // The sweep arrives after the push and finds nothing left to do.
    let report = h
        .scheduler
        .sweep_once(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);

    // A duplicate push is reported as already settled.
    let settled = handler.handle_json(&payload).await.unwrap();
    assert!(matches!(settled, Settled::Superseded(_)));
    let order = OrderStore::get(&h.store, "P1").await.unwrap().unwrap();
    assert_eq!(order.division_status, DivisionStatus::Finished);
}

#[tokio::test]
async fn test_sweep_leaves_in_flight_split_alone() {
    let store = InMemoryStore::new();
    let registry = InMemoryReceiverRegistry::new();
    let sandbox = Arc::new(SandboxChannel::new(SandboxConfig::new("wxpay")));
    let adapters = ChannelAdapters::new().with(Arc::new(SlowSplit {
        inner: sandbox.clone(),
        delay: Duration::from_millis(300),
    }));
    let engine_config = EngineConfig::default();
    let engine = Arc::new(DivisionEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(registry.clone()),
        adapters.clone(),
        engine_config.clone(),
    ));
    let scheduler = ReconciliationScheduler::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        adapters,
        ReconcileConfig {
            grace_ms: 0,
            base_backoff_ms: 0,
            ..ReconcileConfig::default()
        },
        engine_config.channel_timeout(),
    );
    store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
    registry.upsert(binding(1, "wxpay", dec!(0.3))).await.unwrap();

    let divide = tokio::spawn({
        let engine = engine.clone();
        async move { engine.divide_order("P1", &DivideOptions::default()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = scheduler.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(sandbox.query_calls(), 0);

    let outcome = divide.await.unwrap().unwrap();
    assert_eq!(outcome.status, DivideStatus::Succeeded);
    let result = engine.divide_order("P1", &DivideOptions::default()).await;
    assert!(matches!(result, Err(DivisionError::OrderNotEligible { .. })));
    assert_eq!(sandbox.credited(1).await, Amount::new(3_000));
}

#[tokio::test]
async fn test_hung_finalize_is_queried_not_replayed() {
    let mut sandbox = SandboxConfig::new("wxpay");
    sandbox.native_idempotency = false;
    let h = Harness::new(sandbox, 50);
    h.store.insert(order("P1", "wxpay", 10_000)).await.unwrap();
    h.sandbox.push_finalize_reply(SandboxReply::Hang).await;

    let outcome = h
        .engine
        .divide_order("P1", &DivideOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, DivideStatus::Pending);
    assert_eq!(outcome.batch.kind, BatchKind::Finalize);

    let later = Utc::now() + TimeDelta::seconds(1);
    let report = h.scheduler.sweep_once(later).await.unwrap();
    assert_eq!(report.succeeded, 1);
    for _ in 0..4 {
        assert_eq!(h.scheduler.sweep_once(later).await.unwrap().scanned, 0);
    }

    let batch = h.store.get_batch(outcome.batch.id).await.unwrap().unwrap();
    assert_eq!(batch.state, BatchState::Success);
    let order = OrderStore::get(&h.store, "P1").await.unwrap().unwrap();
    assert_eq!(order.division_status, DivisionStatus::Finished);
    assert!(h.sandbox.is_finalized("P1").await);
    assert_eq!(h.sandbox.query_calls(), 1);
    assert_eq!(h.sandbox.finalize_calls(), 1);
}
