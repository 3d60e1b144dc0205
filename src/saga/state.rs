//! Saga State Definitions
//!
//! All enums persist as SMALLINT ids.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction lifecycle status
///
/// Terminal: COMPLETED, FAILED. Nothing mutates a terminal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionStatus {
    /// Persisted, no attempt started yet
    Created = 0,
    /// An attempt is (or was, if the owner crashed) driving the saga
    Processing = 10,
    /// Terminal: every step applied
    Completed = 20,
    /// Terminal: business failure, retry exhaustion or infrastructure error
    Failed = -10,
}

impl TransactionStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransactionStatus::Created),
            10 => Some(TransactionStatus::Processing),
            20 => Some(TransactionStatus::Completed),
            -10 => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "CREATED",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted saga progress. Only moves forward.
///
/// Deposits and withdrawals never leave `None`; their single ledger call is
/// idempotent so there is nothing to resume.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionStep {
    None = 0,
    /// Source debited. Funds are in flight until the credit lands
    DebitDone = 10,
    CreditDone = 20,
}

impl TransactionStep {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransactionStep::None),
            10 => Some(TransactionStep::DebitDone),
            20 => Some(TransactionStep::CreditDone),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStep::None => "NONE",
            TransactionStep::DebitDone => "DEBIT_DONE",
            TransactionStep::CreditDone => "CREDIT_DONE",
        }
    }
}

impl fmt::Display for TransactionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum OperationType {
    Transfer = 1,
    Deposit = 2,
    Withdraw = 3,
}

impl OperationType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(OperationType::Transfer),
            2 => Some(OperationType::Deposit),
            3 => Some(OperationType::Withdraw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Transfer => "TRANSFER",
            OperationType::Deposit => "DEPOSIT",
            OperationType::Withdraw => "WITHDRAW",
        }
    }

    /// Counts toward the rolling daily limit
    #[inline]
    pub fn is_spending(&self) -> bool {
        matches!(self, OperationType::Transfer | OperationType::Withdraw)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the refund credit of a transfer whose credit step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum CompensationStatus {
    /// No compensation was needed
    None = 0,
    /// Source refunded; clean failure
    Succeeded = 1,
    /// Source debited, nothing credited anywhere. Needs manual reconciliation
    Failed = -1,
}

impl CompensationStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(CompensationStatus::None),
            1 => Some(CompensationStatus::Succeeded),
            -1 => Some(CompensationStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationStatus::None => "NONE",
            CompensationStatus::Succeeded => "SUCCEEDED",
            CompensationStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
