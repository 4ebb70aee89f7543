//! Division batches, their per-receiver records, and the batch state machine.

use super::channel::ChannelError;
use super::money::Amount;
use super::receiver::{AccountType, ChannelCode, ReceiverBinding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique, time-ordered batch identifier.
///
/// Doubles as the idempotency key sent to the channel, so it is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// 32-char hex form handed to channels as the out-order number.
    pub fn channel_key(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    /// Funds are pushed to one or more receivers.
    Split,
    /// Nothing is owed to receivers; the channel is told to release the
    /// held amount back to the merchant.
    Finalize,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Split => "split",
            BatchKind::Finalize => "finalize",
        }
    }
}

/// Lifecycle of one division attempt.
///
/// ```text
/// INIT -> SUBMITTED -> SUCCESS | FAILED | UNKNOWN
/// INIT -> FAILED                      (never sent)
/// UNKNOWN -> SUCCESS | FAILED | MANUAL_REVIEW
/// SUBMITTED -> MANUAL_REVIEW
/// MANUAL_REVIEW -> SUCCESS | FAILED   (operator)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Init,
    Submitted,
    Unknown,
    Success,
    Failed,
    /// Reconciliation gave up; an operator must confirm the outcome with the
    /// channel before the order can be retried.
    ManualReview,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Init => "init",
            BatchState::Submitted => "submitted",
            BatchState::Unknown => "unknown",
            BatchState::Success => "success",
            BatchState::Failed => "failed",
            BatchState::ManualReview => "manual_review",
        }
    }

    /// No further automatic or manual transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Success | BatchState::Failed)
    }

    /// While a batch is in one of these states no other batch may be opened
    /// for the same order.
    pub fn blocks_new_attempt(&self) -> bool {
        !matches!(self, BatchState::Failed)
    }

    pub fn can_transition_to(&self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Init, Submitted)
                | (Init, Failed)
                | (Submitted, Success)
                | (Submitted, Failed)
                | (Submitted, Unknown)
                | (Submitted, ManualReview)
                | (Unknown, Success)
                | (Unknown, Failed)
                | (Unknown, ManualReview)
                | (ManualReview, Success)
                | (ManualReview, Failed)
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(BatchState::Init),
            "submitted" => Ok(BatchState::Submitted),
            "unknown" => Ok(BatchState::Unknown),
            "success" => Ok(BatchState::Success),
            "failed" => Ok(BatchState::Failed),
            "manual_review" => Ok(BatchState::ManualReview),
            other => Err(format!("unknown batch state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Pending,
    Success,
    Failed,
}

/// One attempt to divide one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivisionBatch {
    pub id: BatchId,
    pub order_id: String,
    pub channel: ChannelCode,
    pub kind: BatchKind,
    pub state: BatchState,
    pub channel_order_ref: Option<String>,
    /// Reconciliation queries that came back without a definite answer.
    pub attempts: u32,
    pub last_error: Option<ChannelError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DivisionBatch {
    pub fn new(order_id: &str, channel: ChannelCode, kind: BatchKind, now: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::generate(),
            order_id: order_id.to_string(),
            channel,
            kind,
            state: BatchState::Init,
            channel_order_ref: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a state change after checking it against the state machine.
    pub fn apply(
        &mut self,
        to: BatchState,
        update: BatchUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), (BatchState, BatchState)> {
        if !self.state.can_transition_to(to) {
            return Err((self.state, to));
        }
        self.state = to;
        if let Some(reference) = update.channel_order_ref {
            self.channel_order_ref = Some(reference);
        }
        if update.error.is_some() {
            self.last_error = update.error;
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Extra fields written together with a batch transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchUpdate {
    pub channel_order_ref: Option<String>,
    pub error: Option<ChannelError>,
}

/// One receiver's line item within a batch.
///
/// Account details are copied from the binding at division time so the
/// record stays meaningful if the binding is later edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivisionRecord {
    pub batch_id: BatchId,
    pub receiver_id: u64,
    pub account_type: AccountType,
    pub account_no: String,
    pub account_name: String,
    pub amount: Amount,
    pub state: RecordState,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl DivisionRecord {
    pub fn pending(batch_id: BatchId, binding: &ReceiverBinding, amount: Amount) -> Self {
        Self {
            batch_id,
            receiver_id: binding.id,
            account_type: binding.account_type,
            account_no: binding.account_no.clone(),
            account_name: binding.account_name.clone(),
            amount,
            state: RecordState::Pending,
            error_code: None,
            error_message: None,
        }
    }
}

/// Final state for one record, produced from a channel result.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub receiver_id: u64,
    pub state: RecordState,
    pub error: Option<ChannelError>,
}

/// Selection for a reconciliation sweep page.
#[derive(Debug, Clone)]
pub struct StuckQuery {
    pub states: Vec<BatchState>,
    /// Only batches whose `updated_at` is strictly before this instant.
    pub updated_before: DateTime<Utc>,
    /// Resume after this batch id (exclusive).
    pub after: Option<BatchId>,
    pub limit: usize,
}

impl StuckQuery {
    pub fn matches(&self, batch: &DivisionBatch) -> bool {
        self.states.contains(&batch.state)
            && batch.updated_at < self.updated_before
            && self.after.is_none_or(|after| batch.id > after)
    }
}
