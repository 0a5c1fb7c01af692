use crate::models::{Amount, CurrencyId, UserId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("wallet not found")]
    WalletNotFound,
    #[error("transaction not found")]
    TransactionNotFound,
    #[error("wallet already exists for user {user_id} in currency {currency_id}")]
    DuplicateWallet {
        user_id: UserId,
        currency_id: CurrencyId,
    },
    #[error("duplicate transaction hash {0}")]
    DuplicateHash(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("cannot transfer to the same account")]
    SameAccountTransfer,
    #[error("wallet not found for user {user_id} in currency {currency_id}")]
    WalletNotFound {
        user_id: UserId,
        currency_id: CurrencyId,
    },
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Amount, requested: Amount },
    #[error("balance overflow")]
    BalanceOverflow,
    #[error("transfer failed: deadline exceeded")]
    DeadlineExceeded,
    #[error("transaction not found")]
    TransactionNotFound,
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl TransferError {
    /// Stable error code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::SameAccountTransfer => "SAME_ACCOUNT_TRANSFER",
            TransferError::WalletNotFound { .. } => "WALLET_NOT_FOUND",
            TransferError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            TransferError::TransactionNotFound => "TRANSACTION_NOT_FOUND",
            TransferError::BalanceOverflow | TransferError::DeadlineExceeded => {
                "TRANSACTION_FAILED"
            }
            TransferError::Persistence(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("notification channel full")]
    ChannelFull,
    #[error("notification channel closed")]
    ChannelClosed,
    #[error("event log write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
