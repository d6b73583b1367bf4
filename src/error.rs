use crate::domain::money::Money;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{entity} cannot {action} from status '{from}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },
    #[error("payment has approved or processed refunds, or chargeback debits, and cannot be voided")]
    RefundsExist,
    #[error("refund of {requested} exceeds the refundable remainder of {remaining}")]
    OverRefund { requested: Money, remaining: Money },
    #[error("approver must differ from the requester")]
    SelfApproval,
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Money, available: Money },
    #[error("gift card is {status} and cannot accept this transaction")]
    CardNotUsable { status: String },
    #[error("an authorizing operator is required")]
    MissingOperator,
    #[error("chargeback cannot move from '{from}' to '{to}'")]
    InvalidStageTransition { from: String, to: String },
    #[error("payment already has an open chargeback")]
    ActiveChargebackExists,
    #[error("already finalized")]
    AlreadyFinalized,
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("concurrent modification of {entity} '{key}'")]
    VersionConflict { entity: &'static str, key: String },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Errors the caller may retry verbatim; everything else needs a different request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::DeliveryFailure(_)
                | Self::IoError(_)
                | Self::InternalError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
