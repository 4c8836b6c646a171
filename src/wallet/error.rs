//! Wallet domain errors.
//!
//! Every business rejection raised by the transfer routine travels out
//! of the store as a backend code in the 20003..20009 range; this
//! module maps those codes onto a typed taxonomy the caller can match
//! on. Anything without a recognised code collapses into
//! [`WalletError::TransferFailed`] or [`WalletError::Infrastructure`].

use crate::store::{codes, StoreError};
use crate::txn::TxError;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("source and destination accounts must differ")]
    AccountsMustDiffer,

    #[error("transfer amount must be positive")]
    InvalidAmount,

    #[error("account not found")]
    AccountNotFound,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("account is inactive")]
    AccountInactive,

    #[error("currency mismatch between accounts")]
    CurrencyMismatch,

    #[error("duplicate transfer request")]
    DuplicateRequest,

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("transaction state error: {0}")]
    TransactionState(String),
}

impl WalletError {
    /// Map a backend rejection code onto the domain taxonomy.
    /// Unrecognised codes become the generic transfer failure.
    pub fn from_backend_code(code: i32, message: &str) -> Self {
        match code {
            codes::ACCOUNTS_MUST_DIFFER => WalletError::AccountsMustDiffer,
            codes::INVALID_AMOUNT => WalletError::InvalidAmount,
            codes::ACCOUNT_NOT_FOUND => WalletError::AccountNotFound,
            codes::INSUFFICIENT_BALANCE => WalletError::InsufficientBalance,
            codes::ACCOUNT_INACTIVE => WalletError::AccountInactive,
            codes::CURRENCY_MISMATCH => WalletError::CurrencyMismatch,
            codes::DUPLICATE_REQUEST => WalletError::DuplicateRequest,
            _ => WalletError::TransferFailed(message.to_string()),
        }
    }

    /// Stable numeric code, mirroring the backend contract where one
    /// exists.
    pub fn code(&self) -> i32 {
        match self {
            WalletError::AccountsMustDiffer => codes::ACCOUNTS_MUST_DIFFER,
            WalletError::InvalidAmount => codes::INVALID_AMOUNT,
            WalletError::AccountNotFound => codes::ACCOUNT_NOT_FOUND,
            WalletError::InsufficientBalance => codes::INSUFFICIENT_BALANCE,
            WalletError::AccountInactive => codes::ACCOUNT_INACTIVE,
            WalletError::CurrencyMismatch => codes::CURRENCY_MISMATCH,
            WalletError::DuplicateRequest => codes::DUPLICATE_REQUEST,
            WalletError::TransferFailed(_) => 20000,
            WalletError::Infrastructure(_) => 29998,
            WalletError::TransactionState(_) => 29999,
        }
    }

    /// Whether the caller may retry with the SAME request id.
    ///
    /// Only infrastructure faults qualify: the mutation either never
    /// reached the store or rolled back with the request record, so
    /// replaying the id is safe and duplicates are still caught.
    /// Business rejections are final for their inputs.
    pub fn is_retry_safe(&self) -> bool {
        matches!(self, WalletError::Infrastructure(_))
    }
}

impl From<StoreError> for WalletError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Backend { code, message } => Self::from_backend_code(code, &message),
            StoreError::Statement { sql: _, source } => WalletError::from(*source),
            other => WalletError::Infrastructure(other.to_string()),
        }
    }
}

impl From<TxError> for WalletError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Store(store) => WalletError::from(store),
            TxError::InvalidState(detail) => WalletError::TransactionState(detail),
            TxError::NoSavepoint => {
                WalletError::TransactionState("no open child transaction".into())
            }
        }
    }
}
