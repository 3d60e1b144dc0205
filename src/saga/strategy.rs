//! Financial Operation Strategies
//!
//! One variant per operation shape. Each drives the persisted `step` forward
//! and owns its compensation policy.
//!
//! # Transfer
//!
//! ```text
//! NONE ──debit(source, amount)──▶ DEBIT_DONE ──credit(target, target_amount)──▶ CREDIT_DONE
//!                                     │ credit failed (non-conflict)
//!                                     ▼
//!                     credit(source, amount, "<id>:compensation")
//! ```
//!
//! Re-running `execute` on a record at DEBIT_DONE skips the debit. Ledger
//! calls are idempotent per `(operation_id, account_id)`, so two concurrent
//! executions of the same record apply each mutation once.

use super::error::SagaError;
use super::state::{CompensationStatus, OperationType, TransactionStep};
use super::store::TransactionStore;
use super::types::TransactionRecord;
use crate::ledger::{AccountId, Ledger, LedgerError, OperationId};

/// Strategy failure plus what happened to the compensation
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyError {
    pub error: SagaError,
    pub compensation: CompensationStatus,
}

impl StrategyError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

impl From<SagaError> for StrategyError {
    fn from(error: SagaError) -> Self {
        Self {
            error,
            compensation: CompensationStatus::None,
        }
    }
}

impl From<LedgerError> for StrategyError {
    fn from(e: LedgerError) -> Self {
        SagaError::from(e).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinancialOperation {
    Transfer,
    Deposit,
    Withdraw,
}

impl FinancialOperation {
    pub fn for_type(operation_type: OperationType) -> Self {
        match operation_type {
            OperationType::Transfer => FinancialOperation::Transfer,
            OperationType::Deposit => FinancialOperation::Deposit,
            OperationType::Withdraw => FinancialOperation::Withdraw,
        }
    }

    pub async fn execute(
        &self,
        ledger: &dyn Ledger,
        store: &dyn TransactionStore,
        tx: &TransactionRecord,
    ) -> Result<(), StrategyError> {
        match self {
            FinancialOperation::Transfer => execute_transfer(ledger, store, tx).await,
            FinancialOperation::Deposit => {
                let target = target_of(tx)?;
                ledger
                    .credit(target, tx.amount, OperationId::forward(tx.id))
                    .await?;
                tracing::info!(tx_id = tx.id, ledger = ledger.name(), account_id = target, amount = %tx.amount, "Deposit credited");
                Ok(())
            }
            FinancialOperation::Withdraw => {
                let source = source_of(tx)?;
                ledger
                    .debit(source, tx.amount, OperationId::forward(tx.id))
                    .await?;
                tracing::info!(tx_id = tx.id, ledger = ledger.name(), account_id = source, amount = %tx.amount, "Withdrawal debited");
                Ok(())
            }
        }
    }

    /// Return debited funds of a transfer that will not be completed.
    ///
    /// Used when retries run out with the record at DEBIT_DONE. Other shapes
    /// and earlier steps have nothing to undo. A contended refund comes back
    /// as a retryable `Conflict`; the refund itself did not happen.
    pub async fn compensate(
        &self,
        ledger: &dyn Ledger,
        tx: &TransactionRecord,
    ) -> Result<Compensation, SagaError> {
        if *self != FinancialOperation::Transfer || tx.step != TransactionStep::DebitDone {
            return Ok(Compensation::NotNeeded);
        }

        let source = source_of(tx)?;
        match refund_source(ledger, tx, source).await {
            Ok(()) => Ok(Compensation::Refunded),
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(error) => Ok(Compensation::Failed {
                account_id: source,
                error,
            }),
        }
    }
}

/// What [`FinancialOperation::compensate`] did
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    NotNeeded,
    Refunded,
    /// Refund rejected for good; the source stays debited
    Failed {
        account_id: AccountId,
        error: LedgerError,
    },
}

impl Compensation {
    pub fn status(&self) -> CompensationStatus {
        match self {
            Compensation::NotNeeded => CompensationStatus::None,
            Compensation::Refunded => CompensationStatus::Succeeded,
            Compensation::Failed { .. } => CompensationStatus::Failed,
        }
    }
}

async fn execute_transfer(
    ledger: &dyn Ledger,
    store: &dyn TransactionStore,
    tx: &TransactionRecord,
) -> Result<(), StrategyError> {
    let source = source_of(tx)?;
    let target = target_of(tx)?;
    let op = OperationId::forward(tx.id);
    let mut step = tx.step;

    if step == TransactionStep::None {
        // Debit failure: nothing moved, nothing to compensate
        ledger.debit(source, tx.amount, op).await?;
        store.advance_step(tx.id, TransactionStep::DebitDone).await?;
        step = TransactionStep::DebitDone;
        tracing::info!(tx_id = tx.id, ledger = ledger.name(), account_id = source, amount = %tx.amount, step = %step, "Transfer debit done");
    }

    if step == TransactionStep::DebitDone {
        match ledger.credit(target, tx.target_amount, op).await {
            Ok(_) => {
                store.advance_step(tx.id, TransactionStep::CreditDone).await?;
                tracing::info!(
                    tx_id = tx.id,
                    ledger = ledger.name(),
                    account_id = target,
                    amount = %tx.target_amount,
                    step = %TransactionStep::CreditDone,
                    "Transfer credit done"
                );
            }
            // Left at DEBIT_DONE for the next attempt
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(
                    tx_id = tx.id,
                    account_id = target,
                    code = e.code(),
                    error = %e,
                    "Transfer credit failed, compensating"
                );
                return Err(match refund_source(ledger, tx, source).await {
                    Ok(()) => StrategyError {
                        error: e.into(),
                        compensation: CompensationStatus::Succeeded,
                    },
                    // Source row busy: retry the whole step, the refund is idempotent
                    Err(refund) if refund.is_retryable() => refund.into(),
                    Err(refund) => StrategyError {
                        error: SagaError::CompensationFailed(format!(
                            "credit to account {} failed ({}) and refund of {} to account {} failed ({})",
                            target, e, tx.amount, source, refund
                        )),
                        compensation: CompensationStatus::Failed,
                    },
                });
            }
        }
    }

    Ok(())
}

/// Refund credit under the compensation operation id
async fn refund_source(
    ledger: &dyn Ledger,
    tx: &TransactionRecord,
    source: AccountId,
) -> Result<(), LedgerError> {
    match ledger
        .credit(source, tx.amount, OperationId::compensation(tx.id))
        .await
    {
        Ok(_) => {
            tracing::info!(tx_id = tx.id, account_id = source, amount = %tx.amount, "Compensation refund applied");
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                tx_id = tx.id,
                account_id = source,
                amount = %tx.amount,
                code = e.code(),
                error = %e,
                "Compensation refund failed, manual reconciliation required"
            );
            Err(e)
        }
    }
}

fn source_of(tx: &TransactionRecord) -> Result<AccountId, SagaError> {
    tx.source_account_id
        .ok_or_else(|| SagaError::Internal(format!("Transaction {} has no source account", tx.id)))
}

fn target_of(tx: &TransactionRecord) -> Result<AccountId, SagaError> {
    tx.target_account_id
        .ok_or_else(|| SagaError::Internal(format!("Transaction {} has no target account", tx.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::money::Currency;
    use crate::saga::store::{InMemoryTransactionStore, InsertOutcome};
    use crate::saga::types::NewTransaction;
    use rust_decimal::Decimal;

    async fn record(
        store: &InMemoryTransactionStore,
        op: OperationType,
        source: Option<AccountId>,
        target: Option<AccountId>,
        amount: i64,
    ) -> TransactionRecord {
        let InsertOutcome::Inserted(tx) = store
            .insert(NewTransaction {
                user_id: 1,
                source_account_id: source,
                target_account_id: target,
                amount: Decimal::from(amount),
                target_amount: Decimal::from(amount),
                exchange_rate: Decimal::ONE,
                currency: Currency::Usd,
                operation_type: op,
                category_id: None,
                idempotency_key: format!("{:?}-{:?}-{:?}", op, source, target),
            })
            .await
            .unwrap()
        else {
            panic!("unexpected duplicate");
        };
        tx
    }

    #[tokio::test]
    async fn test_transfer_advances_step() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryTransactionStore::new();
        let a = ledger.open_account(1, Currency::Usd, Decimal::from(200));
        let b = ledger.open_account(2, Currency::Usd, Decimal::from(50));
        let tx = record(&store, OperationType::Transfer, Some(a), Some(b), 100).await;

        FinancialOperation::Transfer
            .execute(&ledger, &store, &tx)
            .await
            .unwrap();

        assert_eq!(
            store.get(tx.id).await.unwrap().unwrap().step,
            TransactionStep::CreditDone
        );
        assert_eq!(ledger.balance(a).await, Some(Decimal::from(100)));
        assert_eq!(ledger.balance(b).await, Some(Decimal::from(150)));
    }

    #[tokio::test]
    async fn test_transfer_resume_skips_debit() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryTransactionStore::new();
        let a = ledger.open_account(1, Currency::Usd, Decimal::from(200));
        let b = ledger.open_account(2, Currency::Usd, Decimal::from(50));
        let tx = record(&store, OperationType::Transfer, Some(a), Some(b), 100).await;

        // First run died right after DEBIT_DONE was persisted
        ledger
            .debit(a, Decimal::from(100), OperationId::forward(tx.id))
            .await
            .unwrap();
        store.advance_step(tx.id, TransactionStep::DebitDone).await.unwrap();
        let resumed = store.get(tx.id).await.unwrap().unwrap();

        FinancialOperation::Transfer
            .execute(&ledger, &store, &resumed)
            .await
            .unwrap();

        assert_eq!(ledger.balance(a).await, Some(Decimal::from(100)));
        assert_eq!(ledger.balance(b).await, Some(Decimal::from(150)));
        assert_eq!(ledger.applied_count(a), 1);
    }

    #[tokio::test]
    async fn test_debit_failure_has_no_compensation() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryTransactionStore::new();
        let a = ledger.open_account(1, Currency::Usd, Decimal::from(10));
        let b = ledger.open_account(2, Currency::Usd, Decimal::ZERO);
        let tx = record(&store, OperationType::Transfer, Some(a), Some(b), 100).await;

        let err = FinancialOperation::Transfer
            .execute(&ledger, &store, &tx)
            .await
            .unwrap_err();

        assert_eq!(err.error, SagaError::InsufficientFunds(a));
        assert_eq!(err.compensation, CompensationStatus::None);
        assert_eq!(
            store.get(tx.id).await.unwrap().unwrap().step,
            TransactionStep::None
        );
    }

    #[tokio::test]
    async fn test_credit_failure_refunds_source() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryTransactionStore::new();
        let a = ledger.open_account(1, Currency::Usd, Decimal::from(200));
        let b = ledger.open_account(2, Currency::Usd, Decimal::ZERO);
        ledger.close_account(b).await.unwrap();
        let tx = record(&store, OperationType::Transfer, Some(a), Some(b), 100).await;

        let err = FinancialOperation::Transfer
            .execute(&ledger, &store, &tx)
            .await
            .unwrap_err();

        assert_eq!(err.error, SagaError::AccountInactive(b));
        assert_eq!(err.compensation, CompensationStatus::Succeeded);
        assert_eq!(ledger.balance(a).await, Some(Decimal::from(200)));
        assert_eq!(ledger.applied_count(a), 2);
    }

    #[tokio::test]
    async fn test_compensate_only_when_debit_done() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryTransactionStore::new();
        let a = ledger.open_account(1, Currency::Usd, Decimal::from(200));
        let b = ledger.open_account(2, Currency::Usd, Decimal::ZERO);
        let tx = record(&store, OperationType::Transfer, Some(a), Some(b), 100).await;

        assert_eq!(
            FinancialOperation::Transfer.compensate(&ledger, &tx).await,
            Ok(Compensation::NotNeeded)
        );

        ledger
            .debit(a, Decimal::from(100), OperationId::forward(tx.id))
            .await
            .unwrap();
        store.advance_step(tx.id, TransactionStep::DebitDone).await.unwrap();
        let at_debit = store.get(tx.id).await.unwrap().unwrap();

        assert_eq!(
            FinancialOperation::Transfer.compensate(&ledger, &at_debit).await,
            Ok(Compensation::Refunded)
        );
        assert_eq!(ledger.balance(a).await, Some(Decimal::from(200)));
        assert_eq!(
            FinancialOperation::Withdraw.compensate(&ledger, &at_debit).await,
            Ok(Compensation::NotNeeded)
        );
    }

    #[tokio::test]
    async fn test_compensate_reports_refund_outcome() {
        let ledger = InMemoryLedger::with_lock_timeout(std::time::Duration::from_millis(20));
        let store = InMemoryTransactionStore::new();
        let a = ledger.open_account(1, Currency::Usd, Decimal::from(200));
        let b = ledger.open_account(2, Currency::Usd, Decimal::ZERO);
        let tx = record(&store, OperationType::Transfer, Some(a), Some(b), 100).await;
        ledger
            .debit(a, Decimal::from(100), OperationId::forward(tx.id))
            .await
            .unwrap();
        store.advance_step(tx.id, TransactionStep::DebitDone).await.unwrap();
        let at_debit = store.get(tx.id).await.unwrap().unwrap();

        // Source row held elsewhere: retryable, nothing refunded
        let guard = ledger.hold_lock(a).await.unwrap();
        let contended = FinancialOperation::Transfer
            .compensate(&ledger, &at_debit)
            .await
            .unwrap_err();
        assert!(contended.is_retryable());
        drop(guard);
        assert_eq!(ledger.balance(a).await, Some(Decimal::from(100)));

        ledger.close_account(a).await.unwrap();
        let failed = FinancialOperation::Transfer
            .compensate(&ledger, &at_debit)
            .await
            .unwrap();
        assert_eq!(
            failed,
            Compensation::Failed {
                account_id: a,
                error: LedgerError::AccountInactive(a),
            }
        );
        assert_eq!(failed.status(), CompensationStatus::Failed);
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw_single_step() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryTransactionStore::new();
        let a = ledger.open_account(1, Currency::Eur, Decimal::from(20));

        let dep = record(&store, OperationType::Deposit, None, Some(a), 30).await;
        FinancialOperation::for_type(dep.operation_type)
            .execute(&ledger, &store, &dep)
            .await
            .unwrap();
        // Replay is a no-op
        FinancialOperation::Deposit
            .execute(&ledger, &store, &dep)
            .await
            .unwrap();
        assert_eq!(ledger.balance(a).await, Some(Decimal::from(50)));

        let wd = record(&store, OperationType::Withdraw, Some(a), None, 45).await;
        FinancialOperation::Withdraw
            .execute(&ledger, &store, &wd)
            .await
            .unwrap();
        assert_eq!(ledger.balance(a).await, Some(Decimal::from(5)));
    }
}
