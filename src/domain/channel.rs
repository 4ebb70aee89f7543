//! Values crossing the channel adapter boundary.
//!
//! Adapters never return `Err` for channel-side problems. Every outcome,
//! including timeouts and SDK failures, is folded into one of these result
//! values so the engine only ever branches on [`ChannelStatus`].

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// The channel confirmed the operation.
    Success,
    /// The channel explicitly rejected the operation.
    Failed,
    /// No confirmation either way; the request may or may not have landed.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelError {
    pub code: Option<String>,
    pub message: Option<String>,
}

impl ChannelError {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverResult {
    pub receiver_id: u64,
    pub status: ChannelStatus,
    pub error: Option<ChannelError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitResult {
    pub status: ChannelStatus,
    pub channel_order_ref: Option<String>,
    /// May be empty when the channel reports only an overall outcome.
    pub per_receiver: Vec<ReceiverResult>,
    pub error: Option<ChannelError>,
}

/// Finalize calls report the same shape as splits, without receivers.
pub type FinalizeResult = SplitResult;

impl SplitResult {
    pub fn success(channel_order_ref: Option<String>) -> Self {
        Self {
            status: ChannelStatus::Success,
            channel_order_ref,
            per_receiver: Vec::new(),
            error: None,
        }
    }

    pub fn failed(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status: ChannelStatus::Failed,
            channel_order_ref: None,
            per_receiver: Vec::new(),
            error: Some(ChannelError::new(code, message)),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: ChannelStatus::Unknown,
            channel_order_ref: None,
            per_receiver: Vec::new(),
            error: Some(ChannelError::new(None, message)),
        }
    }

    pub fn with_receivers(mut self, per_receiver: Vec<ReceiverResult>) -> Self {
        self.per_receiver = per_receiver;
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            ChannelStatus::Success => None,
            ChannelStatus::Failed => Some(ErrorKind::PermanentChannel),
            ChannelStatus::Unknown => Some(ErrorKind::TransientChannel),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindResult {
    pub success: bool,
    pub channel_error_code: Option<String>,
    pub channel_error_msg: Option<String>,
}

impl BindResult {
    pub fn confirmed() -> Self {
        Self {
            success: true,
            channel_error_code: None,
            channel_error_msg: None,
        }
    }

    pub fn rejected(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            channel_error_code: code.map(str::to_string),
            channel_error_msg: Some(message.into()),
        }
    }
}

/// Which operations a channel deduplicates natively by batch id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Idempotency {
    pub split: bool,
    pub query: bool,
    pub finalize: bool,
}

impl Idempotency {
    pub const FULL: Self = Self {
        split: true,
        query: true,
        finalize: true,
    };

    /// Queries are read-only everywhere; writes are not deduplicated.
    pub const QUERY_ONLY: Self = Self {
        split: false,
        query: true,
        finalize: false,
    };
}

/// Merchant credentials resolved by the caller for a bind call.
///
/// Credential storage lives outside the engine; this only carries what the
/// adapter needs for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialContext {
    pub merchant_id: String,
    pub app_id: String,
    pub isv_no: Option<String>,
    pub params: BTreeMap<String, String>,
}
