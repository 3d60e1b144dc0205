//! Transaction Store
//!
//! Persistence seam of the orchestrator. Every state write is conditional:
//! status never leaves a terminal value and step never moves backwards, so a
//! slow request and the recovery sweep can both drive the same record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::error::SagaError;
use super::state::{CompensationStatus, TransactionStatus, TransactionStep};
use super::types::{Finalization, NewTransaction, Page, PageRequest, TransactionId, TransactionRecord};
use crate::ledger::{AccountId, UserId};

/// Result of inserting a new saga record
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(TransactionRecord),
    /// Another request owns this idempotency key
    DuplicateKey,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert in CREATED / NONE. Unique on `idempotency_key`.
    async fn insert(&self, new: NewTransaction) -> Result<InsertOutcome, SagaError>;

    async fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>, SagaError>;

    async fn get_by_key(&self, key: &str) -> Result<Option<TransactionRecord>, SagaError>;

    /// Non-terminal → PROCESSING, `attempts += 1`, touch `updated_at`.
    ///
    /// Returns false when the record is already terminal.
    async fn mark_processing(&self, id: TransactionId) -> Result<bool, SagaError>;

    /// Move `step` forward to `step`. No-op (false) if already there or past it.
    async fn advance_step(&self, id: TransactionId, step: TransactionStep)
    -> Result<bool, SagaError>;

    /// Terminal write. No-op (false) if the record is already terminal.
    async fn finalize(&self, id: TransactionId, fin: &Finalization) -> Result<bool, SagaError>;

    /// Non-terminal (CREATED or PROCESSING) records untouched since
    /// `cutoff`, oldest first
    async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, SagaError>;

    /// Records touching `account_id` on either side, newest first
    async fn history(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<TransactionRecord>, SagaError>;

    /// Sum of `target_amount` over COMPLETED TRANSFER/WITHDRAW of `user_id`
    /// created at or after `since`
    async fn sum_completed_spending(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Decimal, SagaError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct Inner {
    rows: BTreeMap<TransactionId, TransactionRecord>,
    keys: HashMap<String, TransactionId>,
    next_id: TransactionId,
}

/// In-memory [`TransactionStore`] with the same conditional-write semantics
/// as the PostgreSQL one
#[derive(Default)]
pub struct InMemoryTransactionStore {
    inner: RwLock<Inner>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Shift `updated_at` and `created_at` into the past
    pub async fn backdate(&self, id: TransactionId, by: chrono::Duration) {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.rows.get_mut(&id) {
            row.updated_at -= by;
            row.created_at -= by;
        }
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, new: NewTransaction) -> Result<InsertOutcome, SagaError> {
        let mut inner = self.inner.write().await;
        if inner.keys.contains_key(&new.idempotency_key) {
            return Ok(InsertOutcome::DuplicateKey);
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        let record = TransactionRecord {
            id,
            user_id: new.user_id,
            source_account_id: new.source_account_id,
            target_account_id: new.target_account_id,
            amount: new.amount,
            target_amount: new.target_amount,
            exchange_rate: new.exchange_rate,
            currency: new.currency,
            status: TransactionStatus::Created,
            step: TransactionStep::None,
            compensation: CompensationStatus::None,
            operation_type: new.operation_type,
            category_id: new.category_id,
            idempotency_key: new.idempotency_key,
            attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        inner.keys.insert(record.idempotency_key.clone(), id);
        inner.rows.insert(id, record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>, SagaError> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<TransactionRecord>, SagaError> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .get(key)
            .and_then(|id| inner.rows.get(id))
            .cloned())
    }

    async fn mark_processing(&self, id: TransactionId) -> Result<bool, SagaError> {
        let mut inner = self.inner.write().await;
        match inner.rows.get_mut(&id) {
            Some(row) if !row.status.is_terminal() => {
                row.status = TransactionStatus::Processing;
                row.attempts += 1;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_step(
        &self,
        id: TransactionId,
        step: TransactionStep,
    ) -> Result<bool, SagaError> {
        let mut inner = self.inner.write().await;
        match inner.rows.get_mut(&id) {
            Some(row) if row.step < step && !row.status.is_terminal() => {
                row.step = step;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&self, id: TransactionId, fin: &Finalization) -> Result<bool, SagaError> {
        let mut inner = self.inner.write().await;
        match inner.rows.get_mut(&id) {
            Some(row) if !row.status.is_terminal() => {
                row.status = fin.status;
                row.compensation = fin.compensation;
                row.error_message = fin.error_message.clone();
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, SagaError> {
        let inner = self.inner.read().await;
        let mut stuck: Vec<TransactionRecord> = inner
            .rows
            .values()
            .filter(|r| !r.status.is_terminal() && r.updated_at < cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.updated_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn history(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<TransactionRecord>, SagaError> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&TransactionRecord> = inner
            .rows
            .values()
            .filter(|r| {
                r.source_account_id == Some(account_id) || r.target_account_id == Some(account_id)
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.size as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            page: page.page,
            size: page.size,
            total,
        })
    }

    async fn sum_completed_spending(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Decimal, SagaError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rows
            .values()
            .filter(|r| {
                r.user_id == user_id
                    && r.status == TransactionStatus::Completed
                    && r.operation_type.is_spending()
                    && r.created_at >= since
            })
            .map(|r| r.target_amount)
            .sum())
    }
}
