//! In-process stand-in for a real payment channel's division API.
//!
//! The sandbox keeps its own view of what it has "executed" (accepted
//! batches, per-receiver credits, finalized orders), so callers can check the
//! economic effect of a run and not just the engine's bookkeeping. Replies can
//! be scripted per call to reproduce timeouts, ambiguous responses and
//! rejections.

use crate::domain::batch::{BatchId, DivisionBatch, DivisionRecord};
use crate::domain::channel::{
    BindResult, ChannelStatus, CredentialContext, FinalizeResult, Idempotency, ReceiverResult,
    SplitResult,
};
use crate::domain::money::Amount;
use crate::domain::order::Order;
use crate::domain::ports::ChannelAdapter;
use crate::domain::receiver::{ChannelCode, ReceiverBinding};
use crate::infrastructure::channels::wxpay::{
    AddReceiverRequest, FinishRequest, ProfitSharingRequest, QueryRequest, ReceiverOutcome,
    SharingOrder, SharingReceiverResult, SharingState, WxpayFault, WxpayTransport,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Error codes the sandbox treats as "try again later" rather than a
/// rejection.
const TRANSIENT_CODES: &[&str] = &[
    "SYSTEM_ERROR",
    "SYSTEMERROR",
    "FREQUENCY_LIMITED",
    "RESOURCE_BUSY",
];

/// Maps a channel error code to the status the engine should act on.
pub fn classify_error_code(code: &str) -> ChannelStatus {
    if TRANSIENT_CODES.contains(&code) {
        ChannelStatus::Unknown
    } else {
        ChannelStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizeMode {
    /// The channel needs an explicit closing call to release held funds.
    #[default]
    Explicit,
    /// The channel releases funds on its own; finalize does nothing.
    NoOp,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub channel: ChannelCode,
    pub finalize_mode: FinalizeMode,
    /// Deduplicates split and finalize by batch id on the channel side.
    pub native_idempotency: bool,
    /// Accepts splits immediately but only confirms them on a later query.
    pub confirm_later: bool,
    pub supports_division: bool,
    /// Accounts the channel refuses to bind or pay.
    pub rejected_accounts: HashSet<String>,
}

impl SandboxConfig {
    pub fn new(channel: impl Into<ChannelCode>) -> Self {
        Self {
            channel: channel.into(),
            finalize_mode: FinalizeMode::Explicit,
            native_idempotency: true,
            confirm_later: false,
            supports_division: true,
            rejected_accounts: HashSet::new(),
        }
    }
}

/// Scripted reply for the next call of a given operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxReply {
    Success,
    Failed { code: String, message: String },
    /// The channel answers, but ambiguously; nothing was executed.
    Unknown,
    /// The request lands and is executed, but the response never arrives.
    Hang,
}

impl SandboxReply {
    pub fn failed(code: &str, message: &str) -> Self {
        SandboxReply::Failed {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Default)]
struct Ledger {
    executed: HashMap<BatchId, SplitResult>,
    /// Orders accepted through the wxpay transport, by `out_order_no`.
    sharing: HashMap<String, SharingOrder>,
    credited: HashMap<u64, Amount>,
    credited_accounts: HashMap<String, Amount>,
    /// Order ids, or transaction ids for the wxpay transport.
    finalized_orders: HashSet<String>,
}

impl Ledger {
    fn credit_account(&mut self, account_no: &str, amount: Amount) {
        let credited = self
            .credited_accounts
            .entry(account_no.to_string())
            .or_default();
        *credited = credited.checked_add(amount).unwrap_or(*credited);
    }
}

#[derive(Default)]
struct Counters {
    bind: AtomicUsize,
    split: AtomicUsize,
    query: AtomicUsize,
    finalize: AtomicUsize,
}

pub struct SandboxChannel {
    config: SandboxConfig,
    split_script: Mutex<VecDeque<SandboxReply>>,
    query_script: Mutex<VecDeque<SandboxReply>>,
    finalize_script: Mutex<VecDeque<SandboxReply>>,
    ledger: Mutex<Ledger>,
    counters: Counters,
}

impl SandboxChannel {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            split_script: Mutex::new(VecDeque::new()),
            query_script: Mutex::new(VecDeque::new()),
            finalize_script: Mutex::new(VecDeque::new()),
            ledger: Mutex::new(Ledger::default()),
            counters: Counters::default(),
        }
    }

    pub async fn push_split_reply(&self, reply: SandboxReply) {
        self.split_script.lock().await.push_back(reply);
    }

    pub async fn push_query_reply(&self, reply: SandboxReply) {
        self.query_script.lock().await.push_back(reply);
    }

    pub async fn push_finalize_reply(&self, reply: SandboxReply) {
        self.finalize_script.lock().await.push_back(reply);
    }

    /// Total amount the channel has paid out to a receiver.
    pub async fn credited(&self, receiver_id: u64) -> Amount {
        let ledger = self.ledger.lock().await;
        ledger
            .credited
            .get(&receiver_id)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Total amount the channel has paid out to an account number.
    pub async fn credited_account(&self, account_no: &str) -> Amount {
        let ledger = self.ledger.lock().await;
        ledger
            .credited_accounts
            .get(account_no)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    pub async fn is_finalized(&self, order_id: &str) -> bool {
        self.ledger.lock().await.finalized_orders.contains(order_id)
    }

    pub fn bind_calls(&self) -> usize {
        self.counters.bind.load(Ordering::SeqCst)
    }

    pub fn split_calls(&self) -> usize {
        self.counters.split.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.counters.query.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.counters.finalize.load(Ordering::SeqCst)
    }

    fn channel_ref(&self, prefix: &str, batch: &DivisionBatch) -> String {
        self.reference(prefix, &batch.id.channel_key())
    }

    fn reference(&self, prefix: &str, key: &str) -> String {
        format!("{}-{prefix}-{key}", self.config.channel)
    }

    /// Executes a split: credits every receiver and remembers the outcome.
    async fn execute(&self, batch: &DivisionBatch, records: &[DivisionRecord]) -> SplitResult {
        let result = SplitResult::success(Some(self.channel_ref("DIV", batch))).with_receivers(
            records
                .iter()
                .map(|r| ReceiverResult {
                    receiver_id: r.receiver_id,
                    status: ChannelStatus::Success,
                    error: None,
                })
                .collect(),
        );
        let mut ledger = self.ledger.lock().await;
        for record in records {
            let credited = ledger.credited.entry(record.receiver_id).or_default();
            *credited = credited.checked_add(record.amount).unwrap_or(*credited);
            ledger.credit_account(&record.account_no, record.amount);
        }
        ledger.executed.insert(batch.id, result.clone());
        result
    }

    fn rejection(code: &str, message: &str, records: &[DivisionRecord]) -> SplitResult {
        match classify_error_code(code) {
            ChannelStatus::Unknown => SplitResult::unknown(format!("{code}: {message}")),
            _ => SplitResult::failed(Some(code), message).with_receivers(
                records
                    .iter()
                    .map(|r| ReceiverResult {
                        receiver_id: r.receiver_id,
                        status: ChannelStatus::Failed,
                        error: None,
                    })
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SandboxChannel {
    fn channel(&self) -> &ChannelCode {
        &self.config.channel
    }

    fn supports_division(&self) -> bool {
        self.config.supports_division
    }

    fn idempotency(&self) -> Idempotency {
        if self.config.native_idempotency {
            Idempotency::FULL
        } else {
            Idempotency::QUERY_ONLY
        }
    }

    async fn bind(
        &self,
        binding: &ReceiverBinding,
        _credentials: &CredentialContext,
    ) -> BindResult {
        self.counters.bind.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(channel = %self.config.channel, receiver_id = binding.id, "sandbox bind");
        if self.config.rejected_accounts.contains(&binding.account_no) {
            return BindResult::rejected(Some("INVALID_ACCOUNT"), "receiver account does not exist");
        }
        BindResult::confirmed()
    }

    async fn split(
        &self,
        order: &Order,
        batch: &DivisionBatch,
        records: &[DivisionRecord],
    ) -> SplitResult {
        self.counters.split.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            channel = %self.config.channel,
            order_id = %order.id,
            batch_id = %batch.id,
            receivers = records.len(),
            "sandbox split"
        );

        if self.config.native_idempotency
            && let Some(previous) = self.ledger.lock().await.executed.get(&batch.id)
        {
            return previous.clone();
        }

        let reply = self.split_script.lock().await.pop_front();
        match reply {
            Some(SandboxReply::Failed { code, message }) => {
                Self::rejection(&code, &message, records)
            }
            Some(SandboxReply::Unknown) => SplitResult::unknown("ambiguous channel response"),
            Some(SandboxReply::Hang) => {
                self.execute(batch, records).await;
                std::future::pending::<SplitResult>().await
            }
            Some(SandboxReply::Success) | None => {
                if let Some(bad) = records
                    .iter()
                    .find(|r| self.config.rejected_accounts.contains(&r.account_no))
                {
                    return Self::rejection(
                        "INVALID_ACCOUNT",
                        &format!("receiver account {} does not exist", bad.account_no),
                        records,
                    );
                }
                let result = self.execute(batch, records).await;
                if self.config.confirm_later {
                    SplitResult {
                        status: ChannelStatus::Unknown,
                        channel_order_ref: result.channel_order_ref,
                        per_receiver: Vec::new(),
                        error: None,
                    }
                } else {
                    result
                }
            }
        }
    }

    async fn query(&self, order: &Order, batch: &DivisionBatch) -> SplitResult {
        self.counters.query.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            channel = %self.config.channel,
            order_id = %order.id,
            batch_id = %batch.id,
            "sandbox query"
        );

        let reply = self.query_script.lock().await.pop_front();
        let executed = self.ledger.lock().await.executed.get(&batch.id).cloned();
        match reply {
            Some(SandboxReply::Failed { code, message }) => Self::rejection(&code, &message, &[]),
            Some(SandboxReply::Unknown) => SplitResult::unknown("channel could not report status"),
            Some(SandboxReply::Hang) => std::future::pending::<SplitResult>().await,
            Some(SandboxReply::Success) => executed
                .unwrap_or_else(|| SplitResult::success(Some(self.channel_ref("DIV", batch)))),
            None => executed.unwrap_or_else(|| {
                SplitResult::failed(
                    Some("ORDER_NOT_EXIST"),
                    "no division request found for this batch",
                )
            }),
        }
    }

    async fn finalize(&self, order: &Order, batch: &DivisionBatch) -> FinalizeResult {
        self.counters.finalize.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            channel = %self.config.channel,
            order_id = %order.id,
            batch_id = %batch.id,
            "sandbox finalize"
        );

        if self.config.finalize_mode == FinalizeMode::NoOp {
            return SplitResult::success(None);
        }
        if self.config.native_idempotency
            && let Some(previous) = self.ledger.lock().await.executed.get(&batch.id)
        {
            return previous.clone();
        }

        let reply = self.finalize_script.lock().await.pop_front();
        let hang = match reply {
            Some(SandboxReply::Failed { code, message }) => {
                return Self::rejection(&code, &message, &[]);
            }
            Some(SandboxReply::Unknown) => {
                return SplitResult::unknown("ambiguous channel response");
            }
            Some(SandboxReply::Hang) => true,
            Some(SandboxReply::Success) | None => false,
        };

        let result = SplitResult::success(Some(self.channel_ref("FIN", batch)));
        {
            let mut ledger = self.ledger.lock().await;
            ledger.finalized_orders.insert(order.id.clone());
            ledger.executed.insert(batch.id, result.clone());
        }
        if hang {
            return std::future::pending::<FinalizeResult>().await;
        }
        result
    }
}

impl SandboxChannel {
    /// Pays every receiver in `request` and remembers the order as finished.
    async fn share(&self, request: &ProfitSharingRequest) -> SharingOrder {
        let shared = SharingOrder {
            order_id: self.reference("DIV", &request.out_order_no),
            out_order_no: request.out_order_no.clone(),
            state: SharingState::Finished,
            receivers: request
                .receivers
                .iter()
                .map(|r| SharingReceiverResult {
                    account: r.account.clone(),
                    amount: r.amount,
                    result: ReceiverOutcome::Success,
                    fail_reason: None,
                })
                .collect(),
        };
        let mut ledger = self.ledger.lock().await;
        for receiver in &request.receivers {
            ledger.credit_account(&receiver.account, Amount::new(receiver.amount));
        }
        ledger
            .sharing
            .insert(request.out_order_no.clone(), shared.clone());
        shared
    }

    async fn previous_sharing(&self, out_order_no: &str) -> Option<SharingOrder> {
        if !self.config.native_idempotency {
            return None;
        }
        self.ledger.lock().await.sharing.get(out_order_no).cloned()
    }
}

#[async_trait]
impl WxpayTransport for SandboxChannel {
    async fn add_receiver(&self, request: &AddReceiverRequest) -> Result<(), WxpayFault> {
        self.counters.bind.fetch_add(1, Ordering::SeqCst);
        if self.config.rejected_accounts.contains(&request.account) {
            return Err(WxpayFault::rejected("RECEIVER_INVALID", "receiver account does not exist"));
        }
        Ok(())
    }

    async fn profit_sharing(
        &self,
        request: &ProfitSharingRequest,
    ) -> Result<SharingOrder, WxpayFault> {
        self.counters.split.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            out_order_no = %request.out_order_no,
            receivers = request.receivers.len(),
            "sandbox profit sharing"
        );
        if let Some(previous) = self.previous_sharing(&request.out_order_no).await {
            return Ok(previous);
        }

        let reply = self.split_script.lock().await.pop_front();
        match reply {
            Some(SandboxReply::Failed { code, message }) => {
                Err(WxpayFault::Rejected { code, message })
            }
            Some(SandboxReply::Unknown) => Err(WxpayFault::Transport(
                "ambiguous channel response".to_string(),
            )),
            Some(SandboxReply::Hang) => {
                self.share(request).await;
                std::future::pending().await
            }
            Some(SandboxReply::Success) | None => {
                if let Some(bad) = request
                    .receivers
                    .iter()
                    .find(|r| self.config.rejected_accounts.contains(&r.account))
                {
                    return Err(WxpayFault::rejected(
                        "RECEIVER_INVALID",
                        format!("receiver account {} does not exist", bad.account),
                    ));
                }
                let shared = self.share(request).await;
                if self.config.confirm_later {
                    return Ok(SharingOrder {
                        state: SharingState::Processing,
                        ..shared
                    });
                }
                Ok(shared)
            }
        }
    }

    async fn query_order(&self, request: &QueryRequest) -> Result<SharingOrder, WxpayFault> {
        self.counters.query.fetch_add(1, Ordering::SeqCst);
        let reply = self.query_script.lock().await.pop_front();
        match reply {
            Some(SandboxReply::Failed { code, message }) => {
                Err(WxpayFault::Rejected { code, message })
            }
            Some(SandboxReply::Unknown) => Err(WxpayFault::Transport(
                "channel could not report status".to_string(),
            )),
            Some(SandboxReply::Hang) => std::future::pending().await,
            Some(SandboxReply::Success) | None => self
                .ledger
                .lock()
                .await
                .sharing
                .get(&request.out_order_no)
                .cloned()
                .ok_or_else(|| {
                    WxpayFault::rejected("RESOURCE_NOT_EXISTS", "no profit sharing order found")
                }),
        }
    }

    async fn finish_order(&self, request: &FinishRequest) -> Result<SharingOrder, WxpayFault> {
        self.counters.finalize.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(transaction_id = %request.transaction_id, "sandbox finish order");
        let finished = SharingOrder {
            order_id: self.reference("FIN", &request.out_order_no),
            out_order_no: request.out_order_no.clone(),
            state: SharingState::Finished,
            receivers: Vec::new(),
        };
        if self.config.finalize_mode == FinalizeMode::NoOp {
            return Ok(finished);
        }
        if let Some(previous) = self.previous_sharing(&request.out_order_no).await {
            return Ok(previous);
        }

        let reply = self.finalize_script.lock().await.pop_front();
        let hang = match reply {
            Some(SandboxReply::Failed { code, message }) => {
                return Err(WxpayFault::Rejected { code, message });
            }
            Some(SandboxReply::Unknown) => {
                return Err(WxpayFault::Transport("ambiguous channel response".to_string()));
            }
            Some(SandboxReply::Hang) => true,
            Some(SandboxReply::Success) | None => false,
        };
        {
            let mut ledger = self.ledger.lock().await;
            ledger
                .finalized_orders
                .insert(request.transaction_id.clone());
            ledger
                .sharing
                .insert(request.out_order_no.clone(), finished.clone());
        }
        if hang {
            return std::future::pending().await;
        }
        Ok(finished)
    }
}
