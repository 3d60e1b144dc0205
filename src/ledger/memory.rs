//! In-Memory Ledger
//!
//! Process-local implementation of the ledger contract. Each account sits
//! behind its own async mutex (the "row lock"); the applied-operation index
//! is a `DashMap` whose vacant-entry insert is the uniqueness anchor.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{
    Account, AccountId, AccountStatus, AppliedTransaction, Ledger, LedgerError, MutationOutcome,
    OperationId, UserId,
};
use crate::money::Currency;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Debit,
    Credit,
}

pub struct InMemoryLedger {
    accounts: DashMap<AccountId, Arc<Mutex<Account>>>,
    applied: DashMap<(OperationId, AccountId), AppliedTransaction>,
    next_id: AtomicI64,
    lock_timeout: Duration,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            applied: DashMap::new(),
            next_id: AtomicI64::new(1),
            lock_timeout,
        }
    }

    /// Open an ACTIVE account with an initial balance
    pub fn open_account(&self, owner_id: UserId, currency: Currency, balance: Decimal) -> AccountId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let account = Account {
            id,
            owner_id,
            currency,
            balance,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        };
        self.accounts.insert(id, Arc::new(Mutex::new(account)));
        id
    }

    pub async fn close_account(&self, account_id: AccountId) -> Result<(), LedgerError> {
        let mut account = self.lock(account_id).await?;
        account.status = AccountStatus::Closed;
        Ok(())
    }

    pub async fn balance(&self, account_id: AccountId) -> Option<Decimal> {
        let slot = self.slot(account_id)?;
        let account = slot.lock().await;
        Some(account.balance)
    }

    /// Number of distinct mutations ever applied to an account
    pub fn applied_count(&self, account_id: AccountId) -> usize {
        self.applied
            .iter()
            .filter(|entry| entry.key().1 == account_id)
            .count()
    }

    pub fn applied(&self, operation_id: OperationId, account_id: AccountId) -> Option<AppliedTransaction> {
        self.applied
            .get(&(operation_id, account_id))
            .map(|entry| entry.value().clone())
    }

    /// Hold the account lock until the guard drops; other mutators see
    /// `LockConflict` once their wait exceeds the lock timeout.
    pub async fn hold_lock(&self, account_id: AccountId) -> Option<OwnedMutexGuard<Account>> {
        let slot = self.slot(account_id)?;
        Some(slot.lock_owned().await)
    }

    fn slot(&self, account_id: AccountId) -> Option<Arc<Mutex<Account>>> {
        self.accounts
            .get(&account_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn lock(&self, account_id: AccountId) -> Result<OwnedMutexGuard<Account>, LedgerError> {
        let slot = self
            .slot(account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;

        tokio::time::timeout(self.lock_timeout, slot.lock_owned())
            .await
            .map_err(|_| LedgerError::LockConflict(account_id))
    }

    async fn mutate(
        &self,
        direction: Direction,
        account_id: AccountId,
        amount: Decimal,
        operation_id: OperationId,
    ) -> Result<MutationOutcome, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }

        let mut account = self.lock(account_id).await?;

        // Vacant-entry insert is the at-most-once guarantee
        let entry = match self.applied.entry((operation_id, account_id)) {
            Entry::Occupied(_) => {
                debug!(
                    account_id = account_id,
                    operation_id = %operation_id,
                    ?direction,
                    "Ledger mutation already applied"
                );
                return Ok(MutationOutcome::Replayed);
            }
            Entry::Vacant(entry) => entry,
        };

        if account.status != AccountStatus::Active {
            return Err(LedgerError::AccountInactive(account_id));
        }

        let delta = match direction {
            Direction::Debit => {
                if account.balance < amount {
                    return Err(LedgerError::InsufficientFunds {
                        account_id,
                        balance: account.balance,
                        requested: amount,
                    });
                }
                -amount
            }
            Direction::Credit => amount,
        };

        account.balance += delta;
        entry.insert(AppliedTransaction {
            operation_id,
            account_id,
            amount: delta,
            applied_at: Utc::now(),
        });

        debug!(
            account_id = account_id,
            operation_id = %operation_id,
            ?direction,
            amount = %amount,
            balance = %account.balance,
            "Ledger mutation applied"
        );
        Ok(MutationOutcome::Applied)
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Account, LedgerError> {
        let account = self.lock(account_id).await?;
        Ok(account.clone())
    }

    async fn debit(
        &self,
        account_id: AccountId,
        amount: Decimal,
        operation_id: OperationId,
    ) -> Result<MutationOutcome, LedgerError> {
        self.mutate(Direction::Debit, account_id, amount, operation_id)
            .await
    }

    async fn credit(
        &self,
        account_id: AccountId,
        amount: Decimal,
        operation_id: OperationId,
    ) -> Result<MutationOutcome, LedgerError> {
        self.mutate(Direction::Credit, account_id, amount, operation_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_debit_applies_once_per_operation() {
        let ledger = InMemoryLedger::new();
        let acc = ledger.open_account(1, Currency::Usd, dec("100"));
        let op = OperationId::forward(10);

        let first = ledger.debit(acc, dec("30"), op).await.unwrap();
        let second = ledger.debit(acc, dec("30"), op).await.unwrap();

        assert_eq!(first, MutationOutcome::Applied);
        assert_eq!(second, MutationOutcome::Replayed);
        assert_eq!(ledger.balance(acc).await, Some(dec("70")));
        assert_eq!(ledger.applied_count(acc), 1);
    }

    #[tokio::test]
    async fn test_same_operation_on_different_accounts_is_distinct() {
        let ledger = InMemoryLedger::new();
        let a = ledger.open_account(1, Currency::Usd, dec("100"));
        let b = ledger.open_account(2, Currency::Usd, dec("0"));
        let op = OperationId::forward(11);

        ledger.debit(a, dec("40"), op).await.unwrap();
        ledger.credit(b, dec("40"), op).await.unwrap();

        assert_eq!(ledger.balance(a).await, Some(dec("60")));
        assert_eq!(ledger.balance(b).await, Some(dec("40")));
    }

    #[tokio::test]
    async fn test_compensation_is_not_swallowed_as_replay() {
        let ledger = InMemoryLedger::new();
        let a = ledger.open_account(1, Currency::Usd, dec("100"));

        ledger.debit(a, dec("25"), OperationId::forward(12)).await.unwrap();
        let refund = ledger
            .credit(a, dec("25"), OperationId::compensation(12))
            .await
            .unwrap();

        assert_eq!(refund, MutationOutcome::Applied);
        assert_eq!(ledger.balance(a).await, Some(dec("100")));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let ledger = InMemoryLedger::new();
        let a = ledger.open_account(1, Currency::Usd, dec("10"));
        let op = OperationId::forward(13);

        let err = ledger.debit(a, dec("10.01"), op).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { account_id, .. } if account_id == a));
        assert_eq!(ledger.balance(a).await, Some(dec("10")));
        assert!(ledger.applied(op, a).is_none());

        // Not recorded, so a later attempt with funds present still applies
        ledger.credit(a, dec("5"), OperationId::forward(99)).await.unwrap();
        assert_eq!(ledger.debit(a, dec("10.01"), op).await, Ok(MutationOutcome::Applied));
    }

    #[tokio::test]
    async fn test_closed_account_rejects_mutation() {
        let ledger = InMemoryLedger::new();
        let a = ledger.open_account(1, Currency::Eur, dec("50"));
        ledger.close_account(a).await.unwrap();

        assert_eq!(
            ledger.credit(a, dec("1"), OperationId::forward(14)).await,
            Err(LedgerError::AccountInactive(a))
        );
        assert_eq!(
            ledger.debit(a, dec("1"), OperationId::forward(15)).await,
            Err(LedgerError::AccountInactive(a))
        );
    }

    #[tokio::test]
    async fn test_replay_wins_over_later_close() {
        let ledger = InMemoryLedger::new();
        let a = ledger.open_account(1, Currency::Eur, dec("50"));
        let op = OperationId::forward(16);
        ledger.debit(a, dec("50"), op).await.unwrap();
        ledger.close_account(a).await.unwrap();

        assert_eq!(ledger.debit(a, dec("50"), op).await, Ok(MutationOutcome::Replayed));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let ledger = InMemoryLedger::new();
        assert_eq!(
            ledger.get_account(404).await,
            Err(LedgerError::AccountNotFound(404))
        );
        assert_eq!(
            ledger.debit(404, dec("1"), OperationId::forward(1)).await,
            Err(LedgerError::AccountNotFound(404))
        );
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let ledger = InMemoryLedger::new();
        let a = ledger.open_account(1, Currency::Usd, dec("50"));
        assert_eq!(
            ledger.credit(a, dec("-5"), OperationId::forward(1)).await,
            Err(LedgerError::InvalidAmount)
        );
    }

    #[tokio::test]
    async fn test_held_lock_surfaces_as_conflict() {
        let ledger = InMemoryLedger::with_lock_timeout(Duration::from_millis(20));
        let a = ledger.open_account(1, Currency::Usd, dec("100"));

        let guard = ledger.hold_lock(a).await.unwrap();
        let err = ledger
            .debit(a, dec("10"), OperationId::forward(17))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::LockConflict(a));
        assert!(err.is_retryable());
        drop(guard);

        assert_eq!(
            ledger.debit(a, dec("10"), OperationId::forward(17)).await,
            Ok(MutationOutcome::Applied)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_do_not_double_spend() {
        let ledger = Arc::new(InMemoryLedger::new());
        let a = ledger.open_account(1, Currency::Usd, dec("100"));

        let l1 = Arc::clone(&ledger);
        let l2 = Arc::clone(&ledger);
        let t1 = tokio::spawn(async move { l1.debit(a, dec("60"), OperationId::forward(100)).await });
        let t2 = tokio::spawn(async move { l2.debit(a, dec("60"), OperationId::forward(101)).await });

        let results = [t1.await.unwrap(), t2.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(insufficient, 1);
        assert_eq!(ledger.balance(a).await, Some(dec("40")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replays_apply_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let a = ledger.open_account(1, Currency::Usd, dec("100"));
        let op = OperationId::forward(200);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.debit(a, dec("10"), op).await })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() == Ok(MutationOutcome::Applied) {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(ledger.balance(a).await, Some(dec("90")));
    }
}
