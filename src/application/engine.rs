use super::adapters::ChannelAdapters;
use super::settlement::{Settled, complete_success, settle};
use crate::config::EngineConfig;
use crate::domain::batch::{BatchKind, BatchState, BatchUpdate, DivisionBatch, DivisionRecord};
use crate::domain::channel::{BindResult, CredentialContext, SplitResult};
use crate::domain::money::Amount;
use crate::domain::order::Order;
use crate::domain::ports::{
    ChannelAdapterRef, DivisionLedgerRef, OrderStoreRef, ReceiverRegistryRef,
};
use crate::domain::receiver::ReceiverBinding;
use crate::domain::split::{ShareRequest, ShareRule, SplitPlan, compute_shares};
use crate::error::{DivisionError, ErrorKind, Result};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;

/// Picks one receiver for a single order, optionally with a fixed amount
/// instead of the binding's ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverOverride {
    pub receiver_id: u64,
    pub amount: Option<Amount>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DivideOptions {
    /// Fail with `NoReceivers` instead of finalizing when nobody is owed.
    pub require_receivers: bool,
    /// Only bindings in one of these receiver groups take part.
    pub group_ids: Option<Vec<u64>>,
    /// Exactly these receivers take part. Each must have an active binding.
    pub receivers: Option<Vec<ReceiverOverride>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivideStatus {
    /// Shares were pushed and confirmed; the order is FINISHED.
    Succeeded,
    /// Nobody was owed anything; the channel released the funds.
    Finalized,
    /// The channel rejected the batch. A later call opens a new one.
    Failed,
    /// No confirmation yet; reconciliation takes over.
    Pending,
    /// Another attempt for the same order is underway or awaiting review.
    InProgress,
    /// An earlier attempt already succeeded.
    AlreadyFinished,
}

impl DivideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivideStatus::Succeeded => "succeeded",
            DivideStatus::Finalized => "finalized",
            DivideStatus::Failed => "failed",
            DivideStatus::Pending => "pending",
            DivideStatus::InProgress => "in_progress",
            DivideStatus::AlreadyFinished => "already_finished",
        }
    }
}

/// Result of one `divide_order` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DivideOutcome {
    pub status: DivideStatus,
    pub error_kind: Option<ErrorKind>,
    pub batch: DivisionBatch,
}

impl DivideOutcome {
    fn new(status: DivideStatus, batch: DivisionBatch) -> Self {
        let error_kind = match status {
            DivideStatus::Failed => Some(ErrorKind::PermanentChannel),
            DivideStatus::Pending => Some(ErrorKind::TransientChannel),
            DivideStatus::InProgress => Some(ErrorKind::Consistency),
            _ => None,
        };
        Self {
            status,
            error_kind,
            batch,
        }
    }

    /// Outcome reflecting wherever the batch currently stands.
    fn from_batch(batch: DivisionBatch) -> Self {
        let status = match (batch.state, batch.kind) {
            (BatchState::Success, BatchKind::Split) => DivideStatus::Succeeded,
            (BatchState::Success, BatchKind::Finalize) => DivideStatus::Finalized,
            (BatchState::Failed, _) => DivideStatus::Failed,
            _ => DivideStatus::Pending,
        };
        Self::new(status, batch)
    }

    fn from_settled(settled: Settled) -> Self {
        match settled {
            Settled::Finished(batch) | Settled::Superseded(batch) => Self::from_batch(batch),
            Settled::Failed(batch) => Self::new(DivideStatus::Failed, batch),
            Settled::Pending(batch) => Self::new(DivideStatus::Pending, batch),
        }
    }
}

/// A binding updated with the channel's answer to a bind request.
#[derive(Debug, Clone, PartialEq)]
pub struct BindOutcome {
    pub binding: ReceiverBinding,
    pub result: BindResult,
}

/// One batch and its records, for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchHistory {
    pub batch: DivisionBatch,
    pub records: Vec<DivisionRecord>,
}

impl BatchHistory {
    pub fn allocated(&self) -> Amount {
        self.records.iter().map(|r| r.amount).sum()
    }
}

/// Drives a division attempt from share computation through the channel call
/// to the ledger outcome.
///
/// The engine holds no per-order state: everything that must survive a crash
/// is in the ledger, and the ledger's open-batch compare-and-swap is the only
/// thing serializing concurrent calls for the same order.
pub struct DivisionEngine {
    orders: OrderStoreRef,
    ledger: DivisionLedgerRef,
    registry: ReceiverRegistryRef,
    adapters: ChannelAdapters,
    config: EngineConfig,
}

impl DivisionEngine {
    pub fn new(
        orders: OrderStoreRef,
        ledger: DivisionLedgerRef,
        registry: ReceiverRegistryRef,
        adapters: ChannelAdapters,
        config: EngineConfig,
    ) -> Self {
        Self {
            orders,
            ledger,
            registry,
            adapters,
            config,
        }
    }

    /// Divides one captured order among its receivers.
    ///
    /// Configuration and integrity problems are returned as errors before
    /// anything is written. Channel outcomes, including rejections and
    /// timeouts, are reported through [`DivideOutcome`].
    pub async fn divide_order(
        &self,
        order_id: &str,
        options: &DivideOptions,
    ) -> Result<DivideOutcome> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| DivisionError::OrderNotFound(order_id.to_string()))?;
        order.ensure_divisible()?;
        let adapter = self.adapters.get(&order.channel)?;

        let receivers = self.select_receivers(&order, options).await?;
        if receivers.is_empty() && (options.require_receivers || self.config.require_receivers) {
            return Err(DivisionError::NoReceivers(order.id.clone()));
        }
        let requests: Vec<ShareRequest> = receivers
            .iter()
            .map(|(binding, fixed)| ShareRequest {
                receiver_id: binding.id,
                rule: match fixed {
                    Some(amount) => ShareRule::Fixed(*amount),
                    None => ShareRule::Ratio(binding.split_ratio),
                },
            })
            .collect();
        let plan = compute_shares(order.amount, &requests, self.config.remainder)?;

        let kind = if plan.is_empty() {
            BatchKind::Finalize
        } else {
            BatchKind::Split
        };
        let (batch, created) = self
            .ledger
            .open_batch(&order.id, &order.channel, kind)
            .await?;
        if !created {
            return self.existing_attempt(batch).await;
        }
        tracing::info!(
            order_id = %order.id,
            batch_id = %batch.id,
            channel = %order.channel,
            kind = batch.kind.as_str(),
            allocated = %plan.allocated(),
            remainder = %plan.remainder,
            "opened division batch"
        );

        match kind {
            BatchKind::Split => {
                self.submit_split(&order, adapter, batch, &plan, &receivers)
                    .await
            }
            BatchKind::Finalize => self.submit_finalize(&order, adapter, batch).await,
        }
    }

    /// Registers a receiver with its channel.
    pub async fn bind_receiver(
        &self,
        binding: &ReceiverBinding,
        credentials: &CredentialContext,
    ) -> Result<BindOutcome> {
        let adapter = self.adapters.get(&binding.channel)?;
        let result = match tokio::time::timeout(
            self.config.channel_timeout(),
            adapter.bind(binding, credentials),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => BindResult::rejected(None, "bind timed out; outcome unknown"),
        };

        let mut bound = binding.clone();
        bound.channel_bind_result = Some(serde_json::to_string(&result)?);
        if result.success {
            bound.bind_success_at = Some(Utc::now());
            tracing::info!(receiver_id = bound.id, channel = %bound.channel, "receiver bound");
        } else {
            tracing::warn!(
                receiver_id = bound.id,
                channel = %bound.channel,
                code = result.channel_error_code.as_deref().unwrap_or(""),
                "receiver bind rejected"
            );
        }
        Ok(BindOutcome {
            binding: bound,
            result,
        })
    }

    /// Every batch opened for the order, oldest first, with its records.
    pub async fn history(&self, order_id: &str) -> Result<Vec<BatchHistory>> {
        if self.orders.get(order_id).await?.is_none() {
            return Err(DivisionError::OrderNotFound(order_id.to_string()));
        }
        let mut history = Vec::new();
        for batch in self.ledger.batches_for_order(order_id).await? {
            let records = self.ledger.records(batch.id).await?;
            history.push(BatchHistory { batch, records });
        }
        Ok(history)
    }

    async fn select_receivers(
        &self,
        order: &Order,
        options: &DivideOptions,
    ) -> Result<Vec<(ReceiverBinding, Option<Amount>)>> {
        let active = self
            .registry
            .list_active_bindings(&order.merchant_id, &order.app_id, &order.channel)
            .await?;

        if let Some(overrides) = &options.receivers {
            return overrides
                .iter()
                .map(|o| {
                    active
                        .iter()
                        .find(|b| b.id == o.receiver_id)
                        .map(|b| (b.clone(), o.amount))
                        .ok_or(DivisionError::ReceiverUnavailable(o.receiver_id))
                })
                .collect();
        }

        Ok(active
            .into_iter()
            .filter(|b| match &options.group_ids {
                Some(groups) => b.group_id.is_some_and(|g| groups.contains(&g)),
                None => true,
            })
            .map(|b| (b, None))
            .collect())
    }

    /// Handles an open_batch call that lost to an earlier batch.
    async fn existing_attempt(&self, batch: DivisionBatch) -> Result<DivideOutcome> {
        if batch.state == BatchState::Success {
            // Settled before a crash, but the order was never finished.
            complete_success(&self.orders, &self.ledger, &batch, None).await?;
            tracing::info!(
                order_id = %batch.order_id,
                batch_id = %batch.id,
                "order already divided"
            );
            return Ok(DivideOutcome::new(DivideStatus::AlreadyFinished, batch));
        }
        if batch.state == BatchState::ManualReview {
            tracing::warn!(
                order_id = %batch.order_id,
                batch_id = %batch.id,
                "order needs manual reconciliation"
            );
        } else {
            tracing::debug!(
                order_id = %batch.order_id,
                batch_id = %batch.id,
                state = %batch.state,
                "division already in progress"
            );
        }
        Ok(DivideOutcome::new(DivideStatus::InProgress, batch))
    }

    async fn submit_split(
        &self,
        order: &Order,
        adapter: &ChannelAdapterRef,
        batch: DivisionBatch,
        plan: &SplitPlan,
        receivers: &[(ReceiverBinding, Option<Amount>)],
    ) -> Result<DivideOutcome> {
        let records = plan
            .shares
            .iter()
            .map(|share| {
                receivers
                    .iter()
                    .find(|(b, _)| b.id == share.receiver_id)
                    .map(|(b, _)| DivisionRecord::pending(batch.id, b, share.amount))
                    .ok_or(DivisionError::ReceiverUnavailable(share.receiver_id))
            })
            .collect::<Result<Vec<_>>>()?;
        self.ledger.append_records(batch.id, records.clone()).await?;

        // From here on the request may reach the channel, so a lost answer
        // must leave the batch SUBMITTED rather than let anyone resend.
        let batch = self
            .ledger
            .transition_batch(
                batch.id,
                &[BatchState::Init],
                BatchState::Submitted,
                BatchUpdate::default(),
            )
            .await?;
        let result = self
            .call_channel(adapter.split(order, &batch, &records))
            .await;
        let settled = settle(
            &self.orders,
            &self.ledger,
            &batch,
            &[BatchState::Submitted],
            &result,
        )
        .await?;
        Ok(DivideOutcome::from_settled(settled))
    }

    async fn submit_finalize(
        &self,
        order: &Order,
        adapter: &ChannelAdapterRef,
        batch: DivisionBatch,
    ) -> Result<DivideOutcome> {
        let batch = self
            .ledger
            .transition_batch(
                batch.id,
                &[BatchState::Init],
                BatchState::Submitted,
                BatchUpdate::default(),
            )
            .await?;
        let result = self.call_channel(adapter.finalize(order, &batch)).await;
        let settled = settle(
            &self.orders,
            &self.ledger,
            &batch,
            &[BatchState::Submitted],
            &result,
        )
        .await?;
        Ok(DivideOutcome::from_settled(settled))
    }

    async fn call_channel(&self, call: impl Future<Output = SplitResult>) -> SplitResult {
        with_timeout(self.config.channel_timeout(), call).await
    }
}

/// Runs a channel call under `timeout`; running out of time is UNKNOWN.
pub(crate) async fn with_timeout(
    timeout: Duration,
    call: impl Future<Output = SplitResult>,
) -> SplitResult {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => SplitResult::unknown(format!(
            "channel did not answer within {}ms",
            timeout.as_millis()
        )),
    }
}
