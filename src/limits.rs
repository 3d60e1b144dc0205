//! Limit Guard
//!
//! Per-user single-transaction and rolling 24h spending ceilings. Limits are
//! created lazily with the configured defaults on first use.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;

use crate::config::LimitsConfig;
use crate::ledger::UserId;
use crate::saga::error::SagaError;
use crate::saga::store::TransactionStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLimit {
    pub user_id: UserId,
    pub daily_limit: Decimal,
    pub single_limit: Decimal,
}

#[async_trait]
pub trait LimitStore: Send + Sync {
    async fn find(&self, user_id: UserId) -> Result<Option<TransactionLimit>, SagaError>;

    /// Insert unless a row exists; returns whichever row is stored afterwards
    async fn insert_if_absent(&self, limit: TransactionLimit)
    -> Result<TransactionLimit, SagaError>;

    async fn update(&self, limit: &TransactionLimit) -> Result<bool, SagaError>;
}

pub struct LimitGuard {
    limits: Arc<dyn LimitStore>,
    transactions: Arc<dyn TransactionStore>,
    defaults: LimitsConfig,
}

impl LimitGuard {
    pub fn new(
        limits: Arc<dyn LimitStore>,
        transactions: Arc<dyn TransactionStore>,
        defaults: LimitsConfig,
    ) -> Self {
        Self {
            limits,
            transactions,
            defaults,
        }
    }

    /// Fails with `LimitExceeded` if `amount` breaks either ceiling
    pub async fn check_limit(&self, user_id: UserId, amount: Decimal) -> Result<(), SagaError> {
        let limit = self.get_limits(user_id).await?;
        if amount > limit.single_limit {
            return Err(SagaError::LimitExceeded(format!(
                "Transaction amount exceeds single limit of {}",
                limit.single_limit
            )));
        }

        let since = Utc::now() - chrono::Duration::hours(24);
        let spent = self
            .transactions
            .sum_completed_spending(user_id, since)
            .await?;

        if spent + amount > limit.daily_limit {
            tracing::info!(
                user_id = user_id,
                spent = %spent,
                amount = %amount,
                daily_limit = %limit.daily_limit,
                "Daily limit exceeded"
            );
            return Err(SagaError::LimitExceeded(format!(
                "Daily limit exceeded. You already spent {} in last 24h. Limit is {}",
                spent, limit.daily_limit
            )));
        }

        Ok(())
    }

    pub async fn get_limits(&self, user_id: UserId) -> Result<TransactionLimit, SagaError> {
        if let Some(limit) = self.limits.find(user_id).await? {
            return Ok(limit);
        }

        tracing::debug!(user_id = user_id, "Creating default transaction limits");
        self.limits
            .insert_if_absent(TransactionLimit {
                user_id,
                daily_limit: self.defaults.default_daily,
                single_limit: self.defaults.default_single,
            })
            .await
    }

    pub async fn update_limits(
        &self,
        user_id: UserId,
        daily_limit: Decimal,
        single_limit: Decimal,
    ) -> Result<TransactionLimit, SagaError> {
        if daily_limit <= Decimal::ZERO || single_limit <= Decimal::ZERO {
            return Err(SagaError::BadRequest("Limits must be greater than zero".to_string()));
        }
        if single_limit > daily_limit {
            return Err(SagaError::BadRequest(
                "Single limit cannot exceed daily limit".to_string(),
            ));
        }

        // Make sure the row exists so the update has something to hit
        self.get_limits(user_id).await?;

        let limit = TransactionLimit {
            user_id,
            daily_limit,
            single_limit,
        };
        if !self.limits.update(&limit).await? {
            return Err(SagaError::NotFound("Limits not found".to_string()));
        }

        tracing::info!(user_id = user_id, daily = %daily_limit, single = %single_limit, "Transaction limits updated");
        Ok(limit)
    }
}

// ============================================================================
// Stores
// ============================================================================

#[derive(Default)]
pub struct InMemoryLimitStore {
    rows: DashMap<UserId, TransactionLimit>,
}

impl InMemoryLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LimitStore for InMemoryLimitStore {
    async fn find(&self, user_id: UserId) -> Result<Option<TransactionLimit>, SagaError> {
        Ok(self.rows.get(&user_id).map(|r| r.value().clone()))
    }

    async fn insert_if_absent(
        &self,
        limit: TransactionLimit,
    ) -> Result<TransactionLimit, SagaError> {
        Ok(self
            .rows
            .entry(limit.user_id)
            .or_insert(limit)
            .value()
            .clone())
    }

    async fn update(&self, limit: &TransactionLimit) -> Result<bool, SagaError> {
        match self.rows.get_mut(&limit.user_id) {
            Some(mut row) => {
                *row = limit.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub struct PgLimitStore {
    pool: PgPool,
}

impl PgLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_limit(row: &sqlx::postgres::PgRow) -> TransactionLimit {
        TransactionLimit {
            user_id: row.get("user_id"),
            daily_limit: row.get("daily_limit"),
            single_limit: row.get("single_limit"),
        }
    }
}

#[async_trait]
impl LimitStore for PgLimitStore {
    async fn find(&self, user_id: UserId) -> Result<Option<TransactionLimit>, SagaError> {
        let row = sqlx::query(
            "SELECT user_id, daily_limit, single_limit FROM transaction_limits_tb WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_limit))
    }

    async fn insert_if_absent(
        &self,
        limit: TransactionLimit,
    ) -> Result<TransactionLimit, SagaError> {
        sqlx::query(
            r#"
            INSERT INTO transaction_limits_tb (user_id, daily_limit, single_limit)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(limit.user_id)
        .bind(limit.daily_limit)
        .bind(limit.single_limit)
        .execute(&self.pool)
        .await?;

        self.find(limit.user_id)
            .await?
            .ok_or_else(|| SagaError::Internal(format!("Limits of user {} vanished", limit.user_id)))
    }

    async fn update(&self, limit: &TransactionLimit) -> Result<bool, SagaError> {
        let result = sqlx::query(
            "UPDATE transaction_limits_tb SET daily_limit = $1, single_limit = $2 WHERE user_id = $3",
        )
        .bind(limit.daily_limit)
        .bind(limit.single_limit)
        .bind(limit.user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
