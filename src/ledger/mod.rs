//! Account Ledger
//!
//! The account-service side of the saga: balances plus at-most-once
//! debit/credit keyed by `(operation_id, account_id)`.
//!
//! # Mutation protocol
//!
//! ```text
//! lock account row → applied? ──yes──▶ Replayed (no balance change)
//!                       │no
//!                       ▼
//!                 ACTIVE? → funds? (debit) → apply delta + insert applied row → Applied
//! ```
//!
//! The applied row and the balance delta commit together. The uniqueness of
//! `(operation_id, account_id)` is enforced by the store itself, not by the
//! preceding existence check.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::LedgerError;
pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::money::Currency;

pub type AccountId = i64;
pub type UserId = i64;

/// Account lifecycle status, stored as SMALLINT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum AccountStatus {
    Active = 1,
    Closed = 2,
}

impl AccountStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AccountStatus::Active),
            2 => Some(AccountStatus::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Account snapshot as exposed by `get_account`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner_id: UserId,
    pub currency: Currency,
    pub balance: Decimal,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

impl Account {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Which leg of a saga a ledger mutation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationPhase {
    /// The saga's own debit or credit
    Forward,
    /// Refund credit issued after a failed transfer credit
    Compensation,
}

/// Idempotency key of a ledger mutation, scoped further by account
///
/// A transfer refund credits the same account the forward debit hit, so the
/// two need distinct ids: `"42"` and `"42:compensation"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId {
    pub transaction_id: i64,
    pub phase: OperationPhase,
}

impl OperationId {
    pub fn forward(transaction_id: i64) -> Self {
        Self {
            transaction_id,
            phase: OperationPhase::Forward,
        }
    }

    pub fn compensation(transaction_id: i64) -> Self {
        Self {
            transaction_id,
            phase: OperationPhase::Compensation,
        }
    }
}

const COMPENSATION_SUFFIX: &str = ":compensation";

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            OperationPhase::Forward => write!(f, "{}", self.transaction_id),
            OperationPhase::Compensation => {
                write!(f, "{}{}", self.transaction_id, COMPENSATION_SUFFIX)
            }
        }
    }
}

impl FromStr for OperationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_suffix(COMPENSATION_SUFFIX) {
            Some(id) => Ok(Self::compensation(id.parse()?)),
            None => Ok(Self::forward(s.parse()?)),
        }
    }
}

/// One applied ledger mutation. Never updated or deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTransaction {
    pub operation_id: OperationId,
    pub account_id: AccountId,
    /// Signed delta: negative for debits
    pub amount: Decimal,
    pub applied_at: DateTime<Utc>,
}

/// Result of a successful debit/credit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Balance changed by this call
    Applied,
    /// `(operation_id, account_id)` was already applied; nothing changed
    Replayed,
}

/// Ledger boundary consumed by the saga
///
/// `debit` and `credit` MUST be idempotent: repeating a call with the same
/// `(operation_id, account_id)` changes the balance at most once, ever.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Ledger name for logging
    fn name(&self) -> &'static str;

    async fn get_account(&self, account_id: AccountId) -> Result<Account, LedgerError>;

    /// Remove `amount` from the account.
    ///
    /// # Errors
    /// `AccountNotFound`, `AccountInactive`, `InsufficientFunds` are terminal;
    /// `LockConflict` is retryable.
    async fn debit(
        &self,
        account_id: AccountId,
        amount: Decimal,
        operation_id: OperationId,
    ) -> Result<MutationOutcome, LedgerError>;

    /// Add `amount` to the account.
    async fn credit(
        &self,
        account_id: AccountId,
        amount: Decimal,
        operation_id: OperationId,
    ) -> Result<MutationOutcome, LedgerError>;
}
