use crate::domain::batch::{BatchId, BatchState};
use miette::Diagnostic;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum DivisionError {
    #[error("Invalid split configuration: {0}")]
    InvalidSplitConfig(String),
    #[error("Receiver {0} is missing or suspended")]
    ReceiverUnavailable(u64),
    #[error("No active receivers for order {0}")]
    NoReceivers(String),
    #[error("Channel '{0}' is not configured for division")]
    UnsupportedChannel(String),
    #[error("Order {0} not found")]
    OrderNotFound(String),
    #[error("Order {order_id} is not eligible for division: {reason}")]
    OrderNotEligible { order_id: String, reason: String },
    #[error("Batch {0} not found")]
    BatchNotFound(BatchId),
    #[error("Invalid transition for batch {batch_id}: {from} -> {to}")]
    InvalidTransition {
        batch_id: BatchId,
        from: BatchState,
        to: BatchState,
    },
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Config parse error: {0}")]
    ConfigParseError(#[from] toml::de::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

/// Coarse error taxonomy used by callers to decide between retrying,
/// surfacing to an operator, or failing fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad split ratios, missing or suspended receivers. Never retried.
    Configuration,
    /// Timeout or ambiguous channel response. Retried by reconciliation.
    TransientChannel,
    /// The channel explicitly rejected the request.
    PermanentChannel,
    /// A concurrent attempt won the ledger compare-and-swap.
    Consistency,
    /// Computed shares exceed the order amount.
    Integrity,
    /// Backend or serialization failure.
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientChannel => "transient_channel",
            ErrorKind::PermanentChannel => "permanent_channel",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

impl DivisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DivisionError::InvalidSplitConfig(_)
            | DivisionError::ReceiverUnavailable(_)
            | DivisionError::NoReceivers(_)
            | DivisionError::UnsupportedChannel(_)
            | DivisionError::OrderNotFound(_)
            | DivisionError::OrderNotEligible { .. }
            | DivisionError::ConfigError(_)
            | DivisionError::ConfigParseError(_) => ErrorKind::Configuration,
            DivisionError::BatchNotFound(_) | DivisionError::InvalidTransition { .. } => {
                ErrorKind::Consistency
            }
            DivisionError::IntegrityViolation(_) => ErrorKind::Integrity,
            DivisionError::CsvError(_)
            | DivisionError::IoError(_)
            | DivisionError::SerializationError(_)
            | DivisionError::InternalError(_) => ErrorKind::Storage,
            #[cfg(feature = "storage-rocksdb")]
            DivisionError::RocksDbError(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        DivisionError::InternalError(Box::new(std::io::Error::other(message.into())))
    }
}

pub type Result<T> = std::result::Result<T, DivisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            DivisionError::InvalidSplitConfig("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            DivisionError::IntegrityViolation("x".into()).kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            DivisionError::InvalidTransition {
                batch_id: BatchId::generate(),
                from: BatchState::Success,
                to: BatchState::Failed,
            }
            .kind(),
            ErrorKind::Consistency
        );
        assert_eq!(DivisionError::internal("boom").kind(), ErrorKind::Storage);
    }
}
