use super::adapters::ChannelAdapters;
use super::engine::with_timeout;
use super::settlement::{Settled, settle};
use crate::config::ReconcileConfig;
use crate::domain::batch::{BatchId, BatchKind, BatchState, BatchUpdate, DivisionBatch, StuckQuery};
use crate::domain::channel::{ChannelError, SplitResult};
use crate::domain::ports::{DivisionLedgerRef, OrderStoreRef};
use crate::error::{DivisionError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// States a sweep looks at. INIT batches older than the grace period were
/// never sent; SUBMITTED and UNKNOWN batches need a status query.
const SWEPT_STATES: [BatchState; 3] =
    [BatchState::Init, BatchState::Submitted, BatchState::Unknown];

/// Lazy, restartable walk over stuck batches, one ledger page at a time.
pub struct StuckBatches {
    ledger: DivisionLedgerRef,
    query: StuckQuery,
    page: VecDeque<DivisionBatch>,
    exhausted: bool,
}

impl StuckBatches {
    pub fn new(
        ledger: DivisionLedgerRef,
        states: Vec<BatchState>,
        updated_before: DateTime<Utc>,
        page_size: usize,
    ) -> Self {
        Self {
            ledger,
            query: StuckQuery {
                states,
                updated_before,
                after: None,
                limit: page_size.max(1),
            },
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Id of the last batch fetched so far.
    pub fn position(&self) -> Option<BatchId> {
        self.query.after
    }

    pub fn restart(&mut self) {
        self.query.after = None;
        self.page.clear();
        self.exhausted = false;
    }

    pub async fn next(&mut self) -> Result<Option<DivisionBatch>> {
        if self.page.is_empty() && !self.exhausted {
            let page = self.ledger.list_stuck(&self.query).await?;
            if page.len() < self.query.limit {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.query.after = Some(last.id);
            }
            self.page.extend(page);
        }
        Ok(self.page.pop_front())
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub still_unknown: usize,
    /// Skipped because their backoff window has not elapsed.
    pub deferred: usize,
    pub manual_review: usize,
    /// INIT batches failed because they were never sent.
    pub abandoned: usize,
    /// Settled by another path between listing and querying.
    pub superseded: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Succeeded,
    Failed,
    StillUnknown,
    Deferred,
    ManualReview,
    Abandoned,
    Superseded,
}

impl SweepReport {
    fn record(&mut self, action: Action) {
        match action {
            Action::Succeeded => self.succeeded += 1,
            Action::Failed => self.failed += 1,
            Action::StillUnknown => self.still_unknown += 1,
            Action::Deferred => self.deferred += 1,
            Action::ManualReview => self.manual_review += 1,
            Action::Abandoned => self.abandoned += 1,
            Action::Superseded => self.superseded += 1,
        }
    }
}

/// Operator decision for a batch in manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualResolution {
    /// The channel confirms the split went through.
    Success,
    /// The channel confirms nothing moved; the order may be divided again.
    Failed,
}

/// Periodically re-checks batches whose outcome is not yet known.
pub struct ReconciliationScheduler {
    orders: OrderStoreRef,
    ledger: DivisionLedgerRef,
    adapters: ChannelAdapters,
    config: ReconcileConfig,
    channel_timeout: Duration,
}

impl ReconciliationScheduler {
    pub fn new(
        orders: OrderStoreRef,
        ledger: DivisionLedgerRef,
        adapters: ChannelAdapters,
        config: ReconcileConfig,
        channel_timeout: Duration,
    ) -> Self {
        Self {
            orders,
            ledger,
            adapters,
            config,
            channel_timeout,
        }
    }

    /// Sweeps until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.sweep_interval_ms,
            grace_ms = self.config.grace_ms,
            "reconciliation started"
        );
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report.scanned > 0 => {
                            tracing::info!(
                                scanned = report.scanned,
                                succeeded = report.succeeded,
                                failed = report.failed,
                                still_unknown = report.still_unknown,
                                manual_review = report.manual_review,
                                "reconciliation sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "reconciliation sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciliation stopped");
    }

    /// One pass over every batch that has been stuck for longer than the
    /// grace period as of `now`. A failure on one batch is logged and counted
    /// and does not stop the sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now
            .checked_sub_signed(to_delta(self.config.grace()))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut stuck = StuckBatches::new(
            self.ledger.clone(),
            SWEPT_STATES.to_vec(),
            cutoff,
            self.config.page_size,
        );

        let mut report = SweepReport::default();
        while let Some(batch) = stuck.next().await? {
            report.scanned += 1;
            match self.reconcile(&batch, now).await {
                Ok(action) => report.record(action),
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        order_id = %batch.order_id,
                        batch_id = %batch.id,
                        error = %e,
                        "failed to reconcile batch"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Applies an operator's decision to a batch in manual review.
    pub async fn resolve_manually(
        &self,
        batch_id: BatchId,
        resolution: ManualResolution,
        note: &str,
    ) -> Result<Settled> {
        let batch = self
            .ledger
            .get_batch(batch_id)
            .await?
            .ok_or(DivisionError::BatchNotFound(batch_id))?;
        let to = match resolution {
            ManualResolution::Success => BatchState::Success,
            ManualResolution::Failed => BatchState::Failed,
        };
        if batch.state != BatchState::ManualReview {
            return Err(DivisionError::InvalidTransition {
                batch_id,
                from: batch.state,
                to,
            });
        }

        let result = match resolution {
            ManualResolution::Success => SplitResult::success(batch.channel_order_ref.clone()),
            ManualResolution::Failed => SplitResult::failed(Some("MANUAL"), note),
        };
        tracing::info!(batch_id = %batch_id, resolution = ?resolution, note, "manual resolution");
        settle(&self.orders, &self.ledger, &batch, &[BatchState::ManualReview], &result).await
    }

    async fn reconcile(&self, batch: &DivisionBatch, now: DateTime<Utc>) -> Result<Action> {
        if batch.state == BatchState::Init {
            return self.abandon(batch).await;
        }

        // Until the channel timeout has passed, the engine call that moved
        // the batch to SUBMITTED may still be waiting for its answer.
        if batch.state == BatchState::Submitted {
            let in_flight_until = batch
                .updated_at
                .checked_add_signed(to_delta(self.channel_timeout))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now < in_flight_until {
                return Ok(Action::Deferred);
            }
        }

        let due = batch
            .updated_at
            .checked_add_signed(to_delta(self.config.backoff(batch.attempts)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if now < due {
            return Ok(Action::Deferred);
        }

        let order = self
            .orders
            .get(&batch.order_id)
            .await?
            .ok_or_else(|| DivisionError::OrderNotFound(batch.order_id.clone()))?;
        let adapter = self.adapters.get(&batch.channel)?;
        let result = match batch.kind {
            BatchKind::Split => {
                with_timeout(self.channel_timeout, adapter.query(&order, batch)).await
            }
            // Finalize carries no receiver payload, so an idempotent channel
            // can simply be asked again.
            BatchKind::Finalize if adapter.idempotency().finalize => {
                with_timeout(self.channel_timeout, adapter.finalize(&order, batch)).await
            }
            BatchKind::Finalize => {
                with_timeout(self.channel_timeout, adapter.query(&order, batch)).await
            }
        };

        let from = [BatchState::Submitted, BatchState::Unknown];
        match settle(&self.orders, &self.ledger, batch, &from, &result).await? {
            Settled::Finished(_) => Ok(Action::Succeeded),
            Settled::Failed(_) => Ok(Action::Failed),
            Settled::Superseded(_) => Ok(Action::Superseded),
            Settled::Pending(pending) => self.count_attempt(&pending).await,
        }
    }

    async fn count_attempt(&self, batch: &DivisionBatch) -> Result<Action> {
        let batch = self.ledger.record_attempt(batch.id).await?;
        if batch.attempts < self.config.max_attempts {
            tracing::debug!(
                batch_id = %batch.id,
                attempts = batch.attempts,
                next_in_ms = self.config.backoff(batch.attempts).as_millis() as u64,
                "batch still unknown"
            );
            return Ok(Action::StillUnknown);
        }

        let update = BatchUpdate {
            channel_order_ref: None,
            error: Some(ChannelError::new(
                Some("MAX_ATTEMPTS"),
                format!("needs manual reconciliation after {} queries", batch.attempts),
            )),
        };
        match self
            .ledger
            .transition_batch(
                batch.id,
                &[BatchState::Submitted, BatchState::Unknown],
                BatchState::ManualReview,
                update,
            )
            .await
        {
            Ok(parked) => {
                tracing::error!(
                    order_id = %parked.order_id,
                    batch_id = %parked.id,
                    attempts = parked.attempts,
                    "batch needs manual reconciliation"
                );
                Ok(Action::ManualReview)
            }
            Err(DivisionError::InvalidTransition { .. }) => Ok(Action::Superseded),
            Err(e) => Err(e),
        }
    }

    async fn abandon(&self, batch: &DivisionBatch) -> Result<Action> {
        let result =
            SplitResult::failed(Some("ABANDONED"), "batch was never submitted to the channel");
        match settle(&self.orders, &self.ledger, batch, &[BatchState::Init], &result).await? {
            Settled::Failed(_) => {
                tracing::warn!(
                    order_id = %batch.order_id,
                    batch_id = %batch.id,
                    "abandoned batch failed"
                );
                Ok(Action::Abandoned)
            }
            _ => Ok(Action::Superseded),
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
