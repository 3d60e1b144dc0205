//! Ledger Error Types

use rust_decimal::Decimal;
use thiserror::Error;

use super::AccountId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Account {0} is not active")]
    AccountInactive(AccountId),

    #[error("Insufficient funds on account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    /// Row lock not acquired in time; the mutation did not happen
    #[error("Account {0} is locked by another operation")]
    LockConflict(AccountId),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Only lock contention is worth repeating immediately
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::LockConflict(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::AccountInactive(_) => "ACCOUNT_INACTIVE",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::LockConflict(_) => "LOCK_CONFLICT",
            LedgerError::Unavailable(_) => "LEDGER_UNAVAILABLE",
        }
    }
}
