//! Saga record, requests and caller-facing views

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::{CompensationStatus, OperationType, TransactionStatus, TransactionStep};
use crate::ledger::{AccountId, UserId};
use crate::money::Currency;

pub type TransactionId = i64;
pub type CategoryId = i64;

/// Persisted saga record
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub user_id: UserId,
    /// None for deposits
    pub source_account_id: Option<AccountId>,
    /// None for withdrawals
    pub target_account_id: Option<AccountId>,
    /// Debited amount, in `currency`
    pub amount: Decimal,
    /// Credited amount, in the target account currency
    pub target_amount: Decimal,
    pub exchange_rate: Decimal,
    /// Currency of the account the operation starts from
    pub currency: Currency,
    pub status: TransactionStatus,
    pub step: TransactionStep,
    pub compensation: CompensationStatus,
    pub operation_type: OperationType,
    pub category_id: Option<CategoryId>,
    pub idempotency_key: String,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload; the store assigns id, timestamps and the CREATED state
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub source_account_id: Option<AccountId>,
    pub target_account_id: Option<AccountId>,
    pub amount: Decimal,
    pub target_amount: Decimal,
    pub exchange_rate: Decimal,
    pub currency: Currency,
    pub operation_type: OperationType,
    pub category_id: Option<CategoryId>,
    pub idempotency_key: String,
}

/// Terminal write applied by `finalize`
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub status: TransactionStatus,
    pub compensation: CompensationStatus,
    pub error_message: Option<String>,
}

impl Finalization {
    pub fn completed() -> Self {
        Self {
            status: TransactionStatus::Completed,
            compensation: CompensationStatus::None,
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>, compensation: CompensationStatus) -> Self {
        Self {
            status: TransactionStatus::Failed,
            compensation,
            error_message: Some(error_message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_account_id: AccountId,
    pub target_account_id: AccountId,
    pub amount: Decimal,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub target_account_id: AccountId,
    pub amount: Decimal,
    /// Ignored: deposits carry no category
    #[serde(default)]
    pub category_id: Option<CategoryId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub source_account_id: AccountId,
    pub amount: Decimal,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
}

/// Caller representation of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: TransactionId,
    pub user_id: UserId,
    pub source_account_id: Option<AccountId>,
    pub target_account_id: Option<AccountId>,
    pub amount: Decimal,
    pub target_amount: Decimal,
    pub exchange_rate: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub step: TransactionStep,
    pub compensation: CompensationStatus,
    pub operation_type: OperationType,
    pub category_id: Option<CategoryId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TransactionRecord> for TransactionView {
    fn from(tx: &TransactionRecord) -> Self {
        Self {
            id: tx.id,
            user_id: tx.user_id,
            source_account_id: tx.source_account_id,
            target_account_id: tx.target_account_id,
            amount: tx.amount,
            target_amount: tx.target_amount,
            exchange_rate: tx.exchange_rate,
            currency: tx.currency,
            status: tx.status,
            step: tx.step,
            compensation: tx.compensation,
            operation_type: tx.operation_type,
            category_id: tx.category_id,
            error_message: tx.error_message.clone(),
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}

impl From<TransactionRecord> for TransactionView {
    fn from(tx: TransactionRecord) -> Self {
        TransactionView::from(&tx)
    }
}

/// Zero-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    /// Size forced into `1..=max`
    pub fn clamped(self, max: u32) -> Self {
        Self {
            page: self.page,
            size: self.size.clamp(1, max.max(1)),
        }
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.page as u64 * self.size as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total: self.total,
        }
    }
}
