//! Transaction Service
//!
//! Orchestrates the saga: idempotency resolution, pre-checks, record
//! creation, the bounded retry loop and terminal finalization. The recovery
//! worker re-enters through [`TransactionService::recover`].

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::SagaError;
use super::state::{CompensationStatus, OperationType, TransactionStatus};
use super::store::{InsertOutcome, TransactionStore};
use super::strategy::{Compensation, FinancialOperation, StrategyError};
use super::types::{
    DepositRequest, Finalization, NewTransaction, Page, PageRequest, TransactionId,
    TransactionRecord, TransactionView, TransferRequest, WithdrawRequest,
};
use crate::category::CategoryService;
use crate::config::SagaConfig;
use crate::ledger::{Account, AccountId, Ledger, LedgerError, UserId};
use crate::limits::LimitGuard;
use crate::money::validate_amount;
use crate::rates::RateConverter;

/// What one recovery pass did with a stuck record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Completed,
    Failed,
    /// Ledger still contended; left PROCESSING for the next sweep
    Deferred,
    /// Someone else finalized it first
    Skipped,
}

pub struct TransactionService {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn TransactionStore>,
    rates: Arc<RateConverter>,
    limits: Arc<LimitGuard>,
    categories: Arc<CategoryService>,
    config: SagaConfig,
}

impl TransactionService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn TransactionStore>,
        rates: Arc<RateConverter>,
        limits: Arc<LimitGuard>,
        categories: Arc<CategoryService>,
        config: SagaConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            rates,
            limits,
            categories,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    pub async fn transfer(
        &self,
        req: TransferRequest,
        user_id: UserId,
        idempotency_key: &str,
    ) -> Result<TransactionView, SagaError> {
        let key = require_key(idempotency_key)?;
        if let Some(existing) = self.store.get_by_key(key).await? {
            return self.replay(existing, user_id).await;
        }

        let amount = validate_amount(req.amount)?;
        if req.source_account_id == req.target_account_id {
            return Err(SagaError::BadRequest(
                "Source and target account cannot be the same".to_string(),
            ));
        }

        let source = self.owned_account(req.source_account_id, user_id).await?;
        let target = self.existing_account(req.target_account_id).await?;
        require_active(&source)?;
        require_active(&target)?;

        let rate = self.rates.get_rate(source.currency, target.currency).await?;
        let target_amount = self.rates.convert(amount, rate);

        let category = self
            .categories
            .resolve(req.category_id, user_id, OperationType::Transfer)
            .await?;
        self.limits.check_limit(user_id, target_amount).await?;

        self.create_and_drive(NewTransaction {
            user_id,
            source_account_id: Some(source.id),
            target_account_id: Some(target.id),
            amount,
            target_amount,
            exchange_rate: rate,
            currency: source.currency,
            operation_type: OperationType::Transfer,
            category_id: category.map(|c| c.id),
            idempotency_key: key.to_string(),
        })
        .await
    }

    pub async fn deposit(
        &self,
        req: DepositRequest,
        user_id: UserId,
        idempotency_key: &str,
    ) -> Result<TransactionView, SagaError> {
        let key = require_key(idempotency_key)?;
        if let Some(existing) = self.store.get_by_key(key).await? {
            return self.replay(existing, user_id).await;
        }

        let amount = validate_amount(req.amount)?;
        let target = self.owned_account(req.target_account_id, user_id).await?;
        require_active(&target)?;
        self.categories
            .resolve(req.category_id, user_id, OperationType::Deposit)
            .await?;

        self.create_and_drive(NewTransaction {
            user_id,
            source_account_id: None,
            target_account_id: Some(target.id),
            amount,
            target_amount: amount,
            exchange_rate: Decimal::ONE,
            currency: target.currency,
            operation_type: OperationType::Deposit,
            category_id: None,
            idempotency_key: key.to_string(),
        })
        .await
    }

    pub async fn withdraw(
        &self,
        req: WithdrawRequest,
        user_id: UserId,
        idempotency_key: &str,
    ) -> Result<TransactionView, SagaError> {
        let key = require_key(idempotency_key)?;
        if let Some(existing) = self.store.get_by_key(key).await? {
            return self.replay(existing, user_id).await;
        }

        let amount = validate_amount(req.amount)?;
        let source = self.owned_account(req.source_account_id, user_id).await?;
        require_active(&source)?;

        let category = self
            .categories
            .resolve(req.category_id, user_id, OperationType::Withdraw)
            .await?;
        self.limits.check_limit(user_id, amount).await?;

        self.create_and_drive(NewTransaction {
            user_id,
            source_account_id: Some(source.id),
            target_account_id: None,
            amount,
            target_amount: amount,
            exchange_rate: Decimal::ONE,
            currency: source.currency,
            operation_type: OperationType::Withdraw,
            category_id: category.map(|c| c.id),
            idempotency_key: key.to_string(),
        })
        .await
    }

    /// Transactions touching an account the caller owns, newest first
    pub async fn get_history(
        &self,
        account_id: AccountId,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<TransactionView>, SagaError> {
        self.owned_account(account_id, user_id).await?;
        let page = page.clamped(self.config.history_page_size_max);
        let records = self.store.history(account_id, page).await?;
        Ok(records.map(TransactionView::from))
    }

    // ========================================================================
    // Saga driving
    // ========================================================================

    async fn replay(
        &self,
        existing: TransactionRecord,
        user_id: UserId,
    ) -> Result<TransactionView, SagaError> {
        if existing.user_id != user_id {
            return Err(SagaError::NotFound("Transaction not found".to_string()));
        }

        info!(
            tx_id = existing.id,
            status = %existing.status,
            "Idempotency key match: returning previous result"
        );

        // The original request died before its first attempt; the replaying
        // request takes over instead of waiting for the sweep
        if existing.status == TransactionStatus::Created {
            return self.drive(existing.id).await;
        }
        Ok(TransactionView::from(existing))
    }

    async fn create_and_drive(&self, new: NewTransaction) -> Result<TransactionView, SagaError> {
        let key = new.idempotency_key.clone();
        let user_id = new.user_id;

        match self.store.insert(new).await? {
            InsertOutcome::Inserted(tx) => {
                info!(
                    tx_id = tx.id,
                    operation = %tx.operation_type,
                    amount = %tx.amount,
                    status = %tx.status,
                    "Transaction created"
                );
                self.drive(tx.id).await
            }
            InsertOutcome::DuplicateKey => {
                warn!(idempotency_key = %key, "Concurrent request saved the transaction first");
                let winner = self.store.get_by_key(&key).await?.ok_or_else(|| {
                    error!(idempotency_key = %key, "Duplicate key reported but no record found");
                    SagaError::Internal("Internal conflict handling error".to_string())
                })?;
                if winner.user_id != user_id {
                    return Err(SagaError::NotFound("Transaction not found".to_string()));
                }
                Ok(TransactionView::from(winner))
            }
        }
    }

    /// Bounded retry loop: conflicts retry with linear backoff, everything
    /// else finalizes FAILED on the spot
    async fn drive(&self, tx_id: TransactionId) -> Result<TransactionView, SagaError> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if !self.store.mark_processing(tx_id).await? {
                debug!(tx_id = tx_id, "Transaction already terminal, returning it");
                return self.view(tx_id).await;
            }

            let tx = self.load(tx_id).await?;
            let operation = FinancialOperation::for_type(tx.operation_type);
            info!(tx_id = tx_id, attempt = attempt, step = %tx.step, "Executing saga attempt");

            match operation
                .execute(self.ledger.as_ref(), self.store.as_ref(), &tx)
                .await
            {
                Ok(()) => {
                    self.finalize(tx_id, &Finalization::completed()).await?;
                    info!(tx_id = tx_id, attempt = attempt, "Transaction completed");
                    return self.view(tx_id).await;
                }
                Err(failure) if failure.is_retryable() && attempt < max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    warn!(
                        tx_id = tx_id,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %failure.error,
                        "Ledger conflict, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(failure) if failure.is_retryable() => {
                    return Err(self.fail_exhausted(operation, tx_id, failure.error).await?);
                }
                Err(failure) => {
                    return Err(self.fail(tx_id, failure).await?);
                }
            }
        }

        // Loop always returns on the last attempt
        Err(SagaError::Internal(format!(
            "Transaction {} left the retry loop without an outcome",
            tx_id
        )))
    }

    /// Re-drive one stuck record from its persisted step, single attempt
    pub async fn recover(&self, tx: &TransactionRecord) -> Result<RecoveryOutcome, SagaError> {
        // Touch the record so an overlapping sweep does not pick it up too
        if !self.store.mark_processing(tx.id).await? {
            return Ok(RecoveryOutcome::Skipped);
        }

        let current = self.load(tx.id).await?;
        let operation = FinancialOperation::for_type(current.operation_type);

        match operation
            .execute(self.ledger.as_ref(), self.store.as_ref(), &current)
            .await
        {
            Ok(()) => {
                self.finalize(tx.id, &Finalization::completed()).await?;
                info!(tx_id = tx.id, "Recovered transaction completed");
                Ok(RecoveryOutcome::Completed)
            }
            Err(failure) if failure.is_retryable() => {
                warn!(tx_id = tx.id, error = %failure.error, "Recovery deferred, ledger busy");
                Ok(RecoveryOutcome::Deferred)
            }
            Err(failure) => {
                let message = format!("Recovery failed: {}", failure.error);
                self.finalize(tx.id, &Finalization::failed(message, failure.compensation))
                    .await?;
                warn!(
                    tx_id = tx.id,
                    compensation = %failure.compensation,
                    error = %failure.error,
                    "Recovered transaction failed"
                );
                Ok(RecoveryOutcome::Failed)
            }
        }
    }

    /// Terminal FAILED for a non-retryable strategy failure, returns the
    /// error to surface
    async fn fail(
        &self,
        tx_id: TransactionId,
        failure: StrategyError,
    ) -> Result<SagaError, SagaError> {
        let message = failure.error.to_string();
        self.finalize(tx_id, &Finalization::failed(&message, failure.compensation))
            .await?;

        if failure.compensation == CompensationStatus::Failed {
            error!(tx_id = tx_id, error = %message, "Transaction FAILED, compensation failed");
        } else {
            warn!(
                tx_id = tx_id,
                compensation = %failure.compensation,
                error = %message,
                "Transaction FAILED"
            );
        }
        Ok(failure.error)
    }

    /// Retries ran out on a conflict. A transfer already at DEBIT_DONE gets
    /// its refund before the record closes. A contended refund leaves the
    /// record PROCESSING so the recovery sweep picks it up again.
    async fn fail_exhausted(
        &self,
        operation: FinancialOperation,
        tx_id: TransactionId,
        conflict: SagaError,
    ) -> Result<SagaError, SagaError> {
        let tx = self.load(tx_id).await?;
        let compensation = match operation.compensate(self.ledger.as_ref(), &tx).await {
            Ok(compensation) => compensation,
            Err(e) if e.is_retryable() => {
                warn!(
                    tx_id = tx_id,
                    step = %tx.step,
                    error = %e,
                    "Refund contended after retry exhaustion, left for recovery"
                );
                return Ok(conflict);
            }
            Err(e) => return Err(e),
        };

        let (message, surfaced) = match &compensation {
            Compensation::Failed { account_id, error } => {
                let err = SagaError::CompensationFailed(format!(
                    "retries exhausted ({}) and refund of {} to account {} failed ({})",
                    conflict, tx.amount, account_id, error
                ));
                (err.to_string(), err)
            }
            _ => (format!("Retry limit exceeded: {}", conflict), conflict),
        };

        let status = compensation.status();
        self.finalize(tx_id, &Finalization::failed(&message, status))
            .await?;
        warn!(
            tx_id = tx_id,
            attempts = self.config.max_attempts,
            compensation = %status,
            "Transaction FAILED after retry exhaustion"
        );
        Ok(surfaced)
    }

    async fn finalize(&self, tx_id: TransactionId, fin: &Finalization) -> Result<(), SagaError> {
        if !self.store.finalize(tx_id, fin).await? {
            // Another driver finalized first; its outcome stands
            debug!(tx_id = tx_id, status = %fin.status, "Finalization skipped, already terminal");
        }
        Ok(())
    }

    async fn load(&self, tx_id: TransactionId) -> Result<TransactionRecord, SagaError> {
        self.store
            .get(tx_id)
            .await?
            .ok_or_else(|| SagaError::Internal(format!("Transaction {} not found", tx_id)))
    }

    async fn view(&self, tx_id: TransactionId) -> Result<TransactionView, SagaError> {
        self.load(tx_id).await.map(TransactionView::from)
    }

    // ========================================================================
    // Pre-checks
    // ========================================================================

    async fn existing_account(&self, account_id: AccountId) -> Result<Account, SagaError> {
        match self.ledger.get_account(account_id).await {
            Ok(account) => Ok(account),
            Err(LedgerError::AccountNotFound(_)) => {
                Err(SagaError::NotFound("Account not found".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Foreign accounts look exactly like missing ones
    async fn owned_account(
        &self,
        account_id: AccountId,
        user_id: UserId,
    ) -> Result<Account, SagaError> {
        let account = self.existing_account(account_id).await?;
        if account.owner_id != user_id {
            debug!(account_id = account_id, user_id = user_id, "Account not owned by caller");
            return Err(SagaError::NotFound("Account not found".to_string()));
        }
        Ok(account)
    }
}

/// Keys are opaque: only an all-whitespace key is rejected, nothing is
/// normalized
fn require_key(idempotency_key: &str) -> Result<&str, SagaError> {
    if idempotency_key.trim().is_empty() {
        return Err(SagaError::BadRequest(
            "Idempotency-Key header is required".to_string(),
        ));
    }
    Ok(idempotency_key)
}

fn require_active(account: &Account) -> Result<(), SagaError> {
    if !account.is_active() {
        return Err(SagaError::AccountInactive(account.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_key() {
        assert_eq!(require_key("k1"), Ok("k1"));
        assert_eq!(require_key(" k1 "), Ok(" k1 "));
        assert!(matches!(require_key(""), Err(SagaError::BadRequest(_))));
        assert!(matches!(require_key("   "), Err(SagaError::BadRequest(_))));
    }
}
