use super::money::Ratio;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Code identifying an external payment channel, e.g. `wxpay`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelCode(String);

impl ChannelCode {
    pub const WXPAY: &'static str = "wxpay";
    pub const ALIPAY: &'static str = "alipay";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Personal account (e.g. a user openid).
    Individual,
    /// Merchant or corporate account.
    Business,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    #[default]
    Active,
    Suspended,
}

/// A merchant's registered payout target on one channel.
///
/// Bindings are owned by the binding-management workflow; the division
/// engine only reads them. They are suspended, never deleted, so that past
/// division records keep pointing at a real binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverBinding {
    pub id: u64,
    pub merchant_id: String,
    /// Service provider the merchant is onboarded through, if any.
    #[serde(default)]
    pub isv_no: Option<String>,
    pub app_id: String,
    pub channel: ChannelCode,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub group_id: Option<u64>,
    #[serde(default)]
    pub group_name: Option<String>,
    pub account_type: AccountType,
    pub account_no: String,
    pub account_name: String,
    /// Relationship between merchant and receiver, e.g. `SERVICE_PROVIDER`.
    pub relation_type: String,
    /// Free-form label used when `relation_type` is `CUSTOM`.
    #[serde(default)]
    pub relation_label: Option<String>,
    pub split_ratio: Ratio,
    #[serde(default)]
    pub state: BindingState,
    /// Raw response of the last channel bind call.
    #[serde(default)]
    pub channel_bind_result: Option<String>,
    #[serde(default)]
    pub channel_ext_info: Option<String>,
    #[serde(default)]
    pub bind_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ReceiverBinding {
    pub fn is_active(&self) -> bool {
        self.state == BindingState::Active
    }

    /// The relationship as shown to the channel: the custom label when one is
    /// set, otherwise the relation type itself.
    pub fn relation_display(&self) -> &str {
        self.relation_label
            .as_deref()
            .filter(|label| !label.is_empty())
            .unwrap_or(&self.relation_type)
    }

    /// Identity used to enforce one binding per merchant, channel and account.
    pub fn unique_key(&self) -> (&str, &ChannelCode, &str) {
        (&self.merchant_id, &self.channel, &self.account_no)
    }
}
