//! WeChat Pay profit-sharing adapter.
//!
//! Shapes batches and records into the channel's request bodies and maps its
//! replies and error codes onto [`SplitResult`]. HTTP, request signing and
//! merchant certificates live behind [`WxpayTransport`].

use crate::domain::batch::{DivisionBatch, DivisionRecord};
use crate::domain::channel::{
    BindResult, ChannelError, ChannelStatus, CredentialContext, FinalizeResult, Idempotency,
    ReceiverResult, SplitResult,
};
use crate::domain::order::Order;
use crate::domain::ports::ChannelAdapter;
use crate::domain::receiver::{AccountType, ChannelCode, ReceiverBinding};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Codes after which the request may still go through if asked again.
const RETRYABLE_CODES: &[&str] = &[
    "SYSTEM_ERROR",
    "SYSTEMERROR",
    "FREQUENCY_LIMITED",
    "RATELIMIT_EXCEEDED",
    "ORDER_NOT_READY",
];

/// Maps a WeChat Pay error code to the status the engine acts on.
///
/// Unlisted codes, including `RESOURCE_NOT_EXISTS` from a query, are final.
pub fn map_error_code(code: &str) -> ChannelStatus {
    if RETRYABLE_CODES.contains(&code) {
        ChannelStatus::Unknown
    } else {
        ChannelStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverType {
    /// Openid under the service provider's app.
    PersonalOpenid,
    MerchantId,
}

impl From<AccountType> for ReceiverType {
    fn from(account_type: AccountType) -> Self {
        match account_type {
            AccountType::Individual => ReceiverType::PersonalOpenid,
            AccountType::Business => ReceiverType::MerchantId,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddReceiverRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_mchid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_appid: Option<String>,
    #[serde(rename = "type")]
    pub receiver_type: ReceiverType,
    pub account: String,
    pub name: String,
    pub relation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_relation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingReceiver {
    #[serde(rename = "type")]
    pub receiver_type: ReceiverType,
    pub account: String,
    /// Minor units.
    pub amount: u64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfitSharingRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_mchid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_appid: Option<String>,
    pub transaction_id: String,
    /// Batch id; the channel deduplicates on it.
    pub out_order_no: String,
    pub receivers: Vec<SharingReceiver>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_mchid: Option<String>,
    pub transaction_id: String,
    pub out_order_no: String,
}

/// Releases the amount still frozen on the payment back to the merchant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_mchid: Option<String>,
    /// Always empty: the finish call fails signature checks when it is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_appid: Option<String>,
    pub transaction_id: String,
    pub out_order_no: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SharingState {
    Processing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverOutcome {
    Pending,
    Success,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingReceiverResult {
    pub account: String,
    pub amount: u64,
    pub result: ReceiverOutcome,
    #[serde(default)]
    pub fail_reason: Option<String>,
}

/// The channel's view of one profit-sharing or finish order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingOrder {
    pub order_id: String,
    pub out_order_no: String,
    pub state: SharingState,
    #[serde(default)]
    pub receivers: Vec<SharingReceiverResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WxpayFault {
    /// The channel answered with an error code.
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },
    /// No usable answer: connection, timeout or an unparseable body.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl WxpayFault {
    pub fn rejected(code: &str, message: impl Into<String>) -> Self {
        WxpayFault::Rejected {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Signed calls to the WeChat Pay profit-sharing API.
#[async_trait]
pub trait WxpayTransport: Send + Sync {
    async fn add_receiver(&self, request: &AddReceiverRequest) -> Result<(), WxpayFault>;
    async fn profit_sharing(
        &self,
        request: &ProfitSharingRequest,
    ) -> Result<SharingOrder, WxpayFault>;
    async fn query_order(&self, request: &QueryRequest) -> Result<SharingOrder, WxpayFault>;
    async fn finish_order(&self, request: &FinishRequest) -> Result<SharingOrder, WxpayFault>;
}

pub type WxpayTransportRef = Arc<dyn WxpayTransport>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WxpayConfig {
    pub channel: ChannelCode,
    pub supports_division: bool,
    /// The channel deduplicates profit-sharing and finish by `out_order_no`.
    pub native_idempotency: bool,
    /// Service-provider mode: the sub-merchant the payment belongs to.
    pub sub_mch_id: Option<String>,
    pub sub_app_id: Option<String>,
}

impl Default for WxpayConfig {
    fn default() -> Self {
        Self {
            channel: ChannelCode::new(ChannelCode::WXPAY),
            supports_division: true,
            native_idempotency: true,
            sub_mch_id: None,
            sub_app_id: None,
        }
    }
}

pub struct WxpayChannel {
    config: WxpayConfig,
    transport: WxpayTransportRef,
}

impl WxpayChannel {
    pub fn new(config: WxpayConfig, transport: WxpayTransportRef) -> Self {
        Self { config, transport }
    }

    /// Receivers with nothing to receive are left out of the payload.
    pub fn split_request(
        &self,
        order: &Order,
        batch: &DivisionBatch,
        records: &[DivisionRecord],
    ) -> ProfitSharingRequest {
        ProfitSharingRequest {
            sub_mchid: self.config.sub_mch_id.clone(),
            sub_appid: self.config.sub_app_id.clone(),
            transaction_id: order.channel_order_ref.clone(),
            out_order_no: batch.id.channel_key(),
            receivers: records
                .iter()
                .filter(|record| !record.amount.is_zero())
                .map(|record| SharingReceiver {
                    receiver_type: record.account_type.into(),
                    account: record.account_no.clone(),
                    amount: record.amount.value(),
                    description: format!("{} division", order.id),
                })
                .collect(),
        }
    }

    pub fn finish_request(&self, order: &Order, batch: &DivisionBatch) -> FinishRequest {
        FinishRequest {
            sub_mchid: self.config.sub_mch_id.clone(),
            sub_appid: None,
            transaction_id: order.channel_order_ref.clone(),
            out_order_no: batch.id.channel_key(),
            description: "finish division".to_string(),
        }
    }

    async fn finish(&self, order: &Order, batch: &DivisionBatch) -> FinalizeResult {
        let request = self.finish_request(order, batch);
        match self.transport.finish_order(&request).await {
            Ok(finished) => sharing_result(finished, &[]),
            Err(fault) => fault_result(fault),
        }
    }
}

/// Translates the channel's order into a split result, matching receivers
/// back to records by account.
fn sharing_result(order: SharingOrder, records: &[DivisionRecord]) -> SplitResult {
    let per_receiver = order
        .receivers
        .iter()
        .filter_map(|receiver| {
            let record = records.iter().find(|r| r.account_no == receiver.account)?;
            let (status, error) = match receiver.result {
                ReceiverOutcome::Success => (ChannelStatus::Success, None),
                ReceiverOutcome::Pending => (ChannelStatus::Unknown, None),
                ReceiverOutcome::Closed => (
                    ChannelStatus::Failed,
                    Some(ChannelError::new(
                        Some("CLOSED"),
                        receiver
                            .fail_reason
                            .clone()
                            .unwrap_or_else(|| "receiver share closed".to_string()),
                    )),
                ),
            };
            Some(ReceiverResult {
                receiver_id: record.receiver_id,
                status,
                error,
            })
        })
        .collect();

    SplitResult {
        status: match order.state {
            SharingState::Finished => ChannelStatus::Success,
            SharingState::Processing => ChannelStatus::Unknown,
        },
        channel_order_ref: Some(order.order_id),
        per_receiver,
        error: None,
    }
}

fn fault_result(fault: WxpayFault) -> SplitResult {
    match fault {
        WxpayFault::Rejected { code, message } => match map_error_code(&code) {
            ChannelStatus::Unknown => SplitResult::unknown(format!("{code}: {message}")),
            _ => SplitResult::failed(Some(&code), message),
        },
        WxpayFault::Transport(message) => SplitResult::unknown(message),
    }
}

#[async_trait]
impl ChannelAdapter for WxpayChannel {
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
        let request = AddReceiverRequest {
            sub_mchid: self.config.sub_mch_id.clone(),
            sub_appid: self.config.sub_app_id.clone(),
            receiver_type: binding.account_type.into(),
            account: binding.account_no.clone(),
            name: binding.account_name.clone(),
            relation_type: binding.relation_type.clone(),
            custom_relation: binding.relation_label.clone(),
        };
        match self.transport.add_receiver(&request).await {
            Ok(()) => BindResult::confirmed(),
            Err(WxpayFault::Rejected { code, message }) => {
                BindResult::rejected(Some(&code), message)
            }
            Err(WxpayFault::Transport(message)) => BindResult::rejected(None, message),
        }
    }

    async fn split(
        &self,
        order: &Order,
        batch: &DivisionBatch,
        records: &[DivisionRecord],
    ) -> SplitResult {
        let request = self.split_request(order, batch, records);
        if request.receivers.is_empty() {
            tracing::debug!(
                order_id = %order.id,
                batch_id = %batch.id,
                "no payable receivers, finishing"
            );
            return self.finish(order, batch).await;
        }
        tracing::debug!(
            order_id = %order.id,
            batch_id = %batch.id,
            receivers = request.receivers.len(),
            "wxpay profit sharing"
        );
        match self.transport.profit_sharing(&request).await {
            Ok(shared) => sharing_result(shared, records),
            Err(fault) => fault_result(fault),
        }
    }

    async fn query(&self, order: &Order, batch: &DivisionBatch) -> SplitResult {
        let request = QueryRequest {
            sub_mchid: self.config.sub_mch_id.clone(),
            transaction_id: order.channel_order_ref.clone(),
            out_order_no: batch.id.channel_key(),
        };
        match self.transport.query_order(&request).await {
            Ok(found) => sharing_result(found, &[]),
            Err(fault) => fault_result(fault),
        }
    }

    async fn finalize(&self, order: &Order, batch: &DivisionBatch) -> FinalizeResult {
        self.finish(order, batch).await
    }
}
