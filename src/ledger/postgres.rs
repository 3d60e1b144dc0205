//! PostgreSQL Ledger
//!
//! Uses `accounts_tb` rows as the lock (`SELECT ... FOR UPDATE` under a
//! bounded `lock_timeout`) and `applied_transactions_tb` as the idempotency
//! anchor. Balance delta and applied row commit in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{
    Account, AccountId, AccountStatus, Ledger, LedgerError, MutationOutcome, OperationId, UserId,
};
use crate::db::{SafeRow, sqlstate};
use crate::money::Currency;

/// SQLSTATEs meaning "someone else holds the row, try again"
const LOCK_NOT_AVAILABLE: &str = "55P03";
const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Debit,
    Credit,
}

pub struct PgLedger {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedger {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Open an ACTIVE account with zero balance
    pub async fn open_account(
        &self,
        owner_id: UserId,
        currency: Currency,
    ) -> Result<AccountId, LedgerError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO accounts_tb (owner_id, currency, balance, status)
            VALUES ($1, $2, 0, $3)
            RETURNING account_id
            "#,
        )
        .bind(owner_id)
        .bind(currency.as_str())
        .bind(AccountStatus::Active.id())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(0, e))?;

        Ok(id)
    }

    pub async fn close_account(&self, account_id: AccountId) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE accounts_tb SET status = $1 WHERE account_id = $2")
            .bind(AccountStatus::Closed.id())
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(account_id, e))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        Ok(())
    }

    async fn begin_locked(&self, account_id: AccountId) -> Result<Transaction<'_, Postgres>, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(account_id, e))?;

        // SET does not take bind parameters; the value is an integer we own
        let set_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(account_id, e))?;

        Ok(tx)
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

        let mut tx = self.begin_locked(account_id).await?;
        let op = operation_id.to_string();

        let row = sqlx::query(
            r#"
            SELECT balance, status FROM accounts_tb
            WHERE account_id = $1
            FOR UPDATE
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(account_id, e))?;

        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Err(LedgerError::AccountNotFound(account_id));
        };

        let (Some(balance), Some(status_id)) = (
            row.try_get_log::<Decimal>("balance"),
            row.try_get_log::<i16>("status"),
        ) else {
            let _ = tx.rollback().await;
            return Err(LedgerError::Unavailable(
                "Critical: accounts_tb row unreadable".to_string(),
            ));
        };

        let already_applied = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM applied_transactions_tb WHERE operation_id = $1 AND account_id = $2",
        )
        .bind(&op)
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(account_id, e))?;

        if already_applied.is_some() {
            let _ = tx.rollback().await;
            debug!(account_id = account_id, operation_id = %op, ?direction, "Ledger mutation already applied");
            return Ok(MutationOutcome::Replayed);
        }

        if AccountStatus::from_id(status_id) != Some(AccountStatus::Active) {
            let _ = tx.rollback().await;
            return Err(LedgerError::AccountInactive(account_id));
        }

        let delta = match direction {
            Direction::Debit => {
                if balance < amount {
                    let _ = tx.rollback().await;
                    return Err(LedgerError::InsufficientFunds {
                        account_id,
                        balance,
                        requested: amount,
                    });
                }
                -amount
            }
            Direction::Credit => amount,
        };

        sqlx::query("UPDATE accounts_tb SET balance = balance + $1 WHERE account_id = $2")
            .bind(delta)
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(account_id, e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO applied_transactions_tb (operation_id, account_id, amount, applied_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (operation_id, account_id) DO NOTHING
            "#,
        )
        .bind(&op)
        .bind(account_id)
        .bind(delta)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(account_id, e))?;

        if inserted.rows_affected() == 0 {
            // Raced past the existence check; drop our balance update
            let _ = tx.rollback().await;
            warn!(account_id = account_id, operation_id = %op, "Concurrent duplicate mutation rejected by unique key");
            return Ok(MutationOutcome::Replayed);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(account_id, e))?;

        debug!(
            account_id = account_id,
            operation_id = %op,
            ?direction,
            amount = %amount,
            "Ledger mutation applied"
        );
        Ok(MutationOutcome::Applied)
    }
}

#[async_trait]
impl Ledger for PgLedger {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Account, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, owner_id, currency, balance, status, created_at
            FROM accounts_tb
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(account_id, e))?
        .ok_or(LedgerError::AccountNotFound(account_id))?;

        let currency: String = row.get("currency");
        let currency = currency
            .parse::<Currency>()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let status_id: i16 = row.get("status");
        let status = AccountStatus::from_id(status_id)
            .ok_or_else(|| LedgerError::Unavailable(format!("Invalid account status: {}", status_id)))?;
        let created_at: DateTime<Utc> = row.get("created_at");

        Ok(Account {
            id: row.get("account_id"),
            owner_id: row.get("owner_id"),
            currency,
            balance: row.get("balance"),
            status,
            created_at,
        })
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

/// Lock contention is retryable; everything else is infrastructure
fn map_sqlx_error(account_id: AccountId, err: sqlx::Error) -> LedgerError {
    match sqlstate(&err).as_deref() {
        Some(LOCK_NOT_AVAILABLE) | Some(DEADLOCK_DETECTED) | Some(SERIALIZATION_FAILURE) => {
            debug!(account_id = account_id, error = %err, "Ledger lock contention");
            LedgerError::LockConflict(account_id)
        }
        _ => {
            error!(account_id = account_id, error = %err, "Ledger database error");
            LedgerError::Unavailable(err.to_string())
        }
    }
}
