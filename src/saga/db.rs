//! Transaction Database Layer
//!
//! PostgreSQL [`TransactionStore`]. State writes are CAS-style conditional
//! UPDATEs; `rows_affected() == 0` means another writer got there first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};

use super::error::SagaError;
use super::state::{CompensationStatus, OperationType, TransactionStatus, TransactionStep};
use super::store::{InsertOutcome, TransactionStore};
use super::types::{Finalization, NewTransaction, Page, PageRequest, TransactionId, TransactionRecord};
use crate::db::is_unique_violation;
use crate::ledger::{AccountId, UserId};
use crate::money::Currency;

const SELECT_COLUMNS: &str = r#"
    SELECT tx_id, user_id, source_account_id, target_account_id, amount, target_amount,
           exchange_rate, currency, status, step, compensation, operation_type, category_id,
           idempotency_key, attempts, error_message, created_at, updated_at
    FROM transactions_tb
"#;

pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TransactionRecord, SagaError> {
        let currency: String = row.get("currency");
        let currency = currency
            .parse::<Currency>()
            .map_err(|e| SagaError::Internal(e.to_string()))?;

        let status_id: i16 = row.get("status");
        let status = TransactionStatus::from_id(status_id)
            .ok_or_else(|| SagaError::Internal(format!("Invalid status ID: {}", status_id)))?;

        let step_id: i16 = row.get("step");
        let step = TransactionStep::from_id(step_id)
            .ok_or_else(|| SagaError::Internal(format!("Invalid step ID: {}", step_id)))?;

        let compensation_id: i16 = row.get("compensation");
        let compensation = CompensationStatus::from_id(compensation_id).ok_or_else(|| {
            SagaError::Internal(format!("Invalid compensation ID: {}", compensation_id))
        })?;

        let op_id: i16 = row.get("operation_type");
        let operation_type = OperationType::from_id(op_id)
            .ok_or_else(|| SagaError::Internal(format!("Invalid operation_type: {}", op_id)))?;

        Ok(TransactionRecord {
            id: row.get("tx_id"),
            user_id: row.get("user_id"),
            source_account_id: row.get("source_account_id"),
            target_account_id: row.get("target_account_id"),
            amount: row.get("amount"),
            target_amount: row.get("target_amount"),
            exchange_rate: row.get("exchange_rate"),
            currency,
            status,
            step,
            compensation,
            operation_type,
            category_id: row.get("category_id"),
            idempotency_key: row.get("idempotency_key"),
            attempts: row.get("attempts"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert(&self, new: NewTransaction) -> Result<InsertOutcome, SagaError> {
        let result = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO transactions_tb
                (user_id, source_account_id, target_account_id, amount, target_amount,
                 exchange_rate, currency, status, step, compensation, operation_type,
                 category_id, idempotency_key, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
            RETURNING tx_id
            "#,
        )
        .bind(new.user_id)
        .bind(new.source_account_id)
        .bind(new.target_account_id)
        .bind(new.amount)
        .bind(new.target_amount)
        .bind(new.exchange_rate)
        .bind(new.currency.as_str())
        .bind(TransactionStatus::Created.id())
        .bind(TransactionStep::None.id())
        .bind(CompensationStatus::None.id())
        .bind(new.operation_type.id())
        .bind(new.category_id)
        .bind(&new.idempotency_key)
        .fetch_one(&self.pool)
        .await;

        let id = match result {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                tracing::warn!(idempotency_key = %new.idempotency_key, "Idempotency key already taken");
                return Ok(InsertOutcome::DuplicateKey);
            }
            Err(e) => return Err(e.into()),
        };

        let record = self
            .get(id)
            .await?
            .ok_or_else(|| SagaError::Internal(format!("Transaction {} vanished after insert", id)))?;
        Ok(InsertOutcome::Inserted(record))
    }

    async fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>, SagaError> {
        let sql = format!("{} WHERE tx_id = $1", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<TransactionRecord>, SagaError> {
        let sql = format!("{} WHERE idempotency_key = $1", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn mark_processing(&self, id: TransactionId) -> Result<bool, SagaError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET status = $1, attempts = attempts + 1, updated_at = NOW()
            WHERE tx_id = $2 AND status IN ($3, $1)
            "#,
        )
        .bind(TransactionStatus::Processing.id())
        .bind(id)
        .bind(TransactionStatus::Created.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn advance_step(
        &self,
        id: TransactionId,
        step: TransactionStep,
    ) -> Result<bool, SagaError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET step = $1, updated_at = NOW()
            WHERE tx_id = $2 AND step < $1 AND status IN ($3, $4)
            "#,
        )
        .bind(step.id())
        .bind(id)
        .bind(TransactionStatus::Created.id())
        .bind(TransactionStatus::Processing.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finalize(&self, id: TransactionId, fin: &Finalization) -> Result<bool, SagaError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET status = $1, compensation = $2, error_message = $3, updated_at = NOW()
            WHERE tx_id = $4 AND status IN ($5, $6)
            "#,
        )
        .bind(fin.status.id())
        .bind(fin.compensation.id())
        .bind(&fin.error_message)
        .bind(id)
        .bind(TransactionStatus::Created.id())
        .bind(TransactionStatus::Processing.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, SagaError> {
        let sql = format!(
            "{} WHERE status IN ($1, $2) AND updated_at < $3 ORDER BY updated_at ASC LIMIT $4",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(TransactionStatus::Created.id())
            .bind(TransactionStatus::Processing.id())
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn history(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<TransactionRecord>, SagaError> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM transactions_tb
            WHERE source_account_id = $1 OR target_account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "{} WHERE source_account_id = $1 OR target_account_id = $1 \
             ORDER BY created_at DESC, tx_id DESC LIMIT $2 OFFSET $3",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .bind(page.size as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            page: page.page,
            size: page.size,
            total: total.max(0) as u64,
        })
    }

    async fn sum_completed_spending(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Decimal, SagaError> {
        let sum = sqlx::query_scalar::<_, Option<Decimal>>(
            r#"
            SELECT SUM(target_amount) FROM transactions_tb
            WHERE user_id = $1 AND status = $2 AND operation_type IN ($3, $4)
              AND created_at >= $5
            "#,
        )
        .bind(user_id)
        .bind(TransactionStatus::Completed.id())
        .bind(OperationType::Transfer.id())
        .bind(OperationType::Withdraw.id())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(sum.unwrap_or(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool::create_test_pool;

    fn new_tx(key: &str) -> NewTransaction {
        NewTransaction {
            user_id: 7001,
            source_account_id: Some(1),
            target_account_id: Some(2),
            amount: Decimal::from(100),
            target_amount: Decimal::from(92),
            exchange_rate: Decimal::new(92, 2),
            currency: Currency::Usd,
            operation_type: OperationType::Transfer,
            category_id: None,
            idempotency_key: key.to_string(),
        }
    }

    fn unique_key(prefix: &str) -> String {
        format!("{}-{}", prefix, Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_insert_and_duplicate_key() {
        let store = PgTransactionStore::new(create_test_pool().await);
        let key = unique_key("dup");

        let InsertOutcome::Inserted(tx) = store.insert(new_tx(&key)).await.unwrap() else {
            panic!("first insert must succeed");
        };
        assert_eq!(tx.status, TransactionStatus::Created);
        assert_eq!(tx.exchange_rate, Decimal::new(92, 2));

        assert_eq!(
            store.insert(new_tx(&key)).await.unwrap(),
            InsertOutcome::DuplicateKey
        );
        assert_eq!(store.get_by_key(&key).await.unwrap().unwrap().id, tx.id);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_conditional_writes() {
        let store = PgTransactionStore::new(create_test_pool().await);
        let InsertOutcome::Inserted(tx) = store.insert(new_tx(&unique_key("cas"))).await.unwrap()
        else {
            panic!("insert must succeed");
        };

        assert!(store.mark_processing(tx.id).await.unwrap());
        assert!(store.advance_step(tx.id, TransactionStep::DebitDone).await.unwrap());
        assert!(!store.advance_step(tx.id, TransactionStep::None).await.unwrap());
        assert!(store.finalize(tx.id, &Finalization::completed()).await.unwrap());
        assert!(!store.mark_processing(tx.id).await.unwrap());

        let row = store.get(tx.id).await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Completed);
        assert_eq!(row.step, TransactionStep::DebitDone);
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_find_stuck_includes_abandoned_created() {
        let store = PgTransactionStore::new(create_test_pool().await);
        let InsertOutcome::Inserted(tx) = store.insert(new_tx(&unique_key("stuck"))).await.unwrap()
        else {
            panic!("insert must succeed");
        };
        sqlx::query("UPDATE transactions_tb SET updated_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
            .bind(tx.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(30);
        let stuck = store.find_stuck(cutoff, 1000).await.unwrap();
        let found = stuck.iter().find(|r| r.id == tx.id).unwrap();
        assert_eq!(found.status, TransactionStatus::Created);
    }
}
