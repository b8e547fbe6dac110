use common::{ErrorCode, UserId};
use outbox::StoreError;
use thiserror::Error;

/// Errors surfaced by the wallet service.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("{0}")]
    InvalidArgument(&'static str),

    /// Debit against a user who never had a wallet.
    #[error("wallet not found, please create wallet first")]
    WalletNotFound(UserId),

    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: i64, required: i64 },

    #[error("{0} not found")]
    NotFound(&'static str),

    /// The idempotency key already names another user's ledger row.
    #[error("biz_order_id {0} is already used by another user")]
    KeyInUse(String),

    /// Storage failure. The message shown to callers carries no detail;
    /// the source is logged.
    #[error("transaction failed, please try again later")]
    Store(#[from] StoreError),

    /// A ledger hook refused the change.
    #[error("transaction failed, please try again later")]
    Hook(String),
}

impl WalletError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WalletError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            WalletError::WalletNotFound(_) => ErrorCode::FailedPrecondition,
            WalletError::InsufficientBalance { .. } => ErrorCode::ResourceExhausted,
            WalletError::NotFound(_) => ErrorCode::NotFound,
            WalletError::KeyInUse(_) => ErrorCode::AlreadyExists,
            WalletError::Store(_) | WalletError::Hook(_) => ErrorCode::Internal,
        }
    }

    /// Whether a consumer should ask for redelivery.
    pub fn is_transient(&self) -> bool {
        self.code().is_retryable()
    }
}

/// Result type for wallet operations.
pub type Result<T> = std::result::Result<T, WalletError>;
