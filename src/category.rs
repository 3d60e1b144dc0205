//! Transaction categories
//!
//! Global categories (`user_id = None`) are usable by everyone; a custom
//! category belongs to the user who created it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::is_unique_violation;
use crate::ledger::UserId;
use crate::saga::error::SagaError;
use crate::saga::state::OperationType;
use crate::saga::types::CategoryId;

/// Seeded at bootstrap as global categories
pub const DEFAULT_CATEGORIES: [&str; 7] = [
    "TRANSFER",
    "FOOD",
    "RENT",
    "TRANSPORT",
    "SHOPPING",
    "OTHER",
    "ENTERTAINMENT",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCategory {
    pub id: CategoryId,
    /// None for global categories
    pub user_id: Option<UserId>,
    pub name: String,
}

impl TransactionCategory {
    #[inline]
    pub fn is_global(&self) -> bool {
        self.user_id.is_none()
    }

    pub fn usable_by(&self, user_id: UserId) -> bool {
        self.user_id.is_none_or(|owner| owner == user_id)
    }
}

#[async_trait]
pub trait CategoryStore: Send + Sync {
    async fn find(&self, id: CategoryId) -> Result<Option<TransactionCategory>, SagaError>;

    /// Global categories plus the user's own
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<TransactionCategory>, SagaError>;

    /// None when the user already has a category with this name
    async fn insert(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<TransactionCategory>, SagaError>;
}

pub struct CategoryService {
    store: Arc<dyn CategoryStore>,
}

impl CategoryService {
    pub fn new(store: Arc<dyn CategoryStore>) -> Self {
        Self { store }
    }

    pub async fn list_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<TransactionCategory>, SagaError> {
        self.store.list_for_user(user_id).await
    }

    pub async fn create_custom(
        &self,
        name: &str,
        user_id: UserId,
    ) -> Result<TransactionCategory, SagaError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SagaError::BadRequest("Category name is required".to_string()));
        }

        let category = self
            .store
            .insert(user_id, name)
            .await?
            .ok_or_else(|| SagaError::BadRequest("Category already exists".to_string()))?;

        tracing::info!(user_id = user_id, category_id = category.id, name = %category.name, "Custom category created");
        Ok(category)
    }

    /// Category entitlement check for a new transaction
    ///
    /// Deposits carry no category; any supplied id is ignored.
    pub async fn resolve(
        &self,
        category_id: Option<CategoryId>,
        user_id: UserId,
        operation_type: OperationType,
    ) -> Result<Option<TransactionCategory>, SagaError> {
        if operation_type == OperationType::Deposit {
            return Ok(None);
        }

        let category_id = category_id.ok_or_else(|| {
            SagaError::BadRequest(format!(
                "Category is required for transaction type: {}",
                operation_type
            ))
        })?;

        let category = self.store.find(category_id).await?.ok_or_else(|| {
            SagaError::BadRequest(format!("Category not found with id: {}", category_id))
        })?;

        if !category.usable_by(user_id) {
            tracing::warn!(
                user_id = user_id,
                category_id = category_id,
                owner_id = ?category.user_id,
                "Private category used by another user"
            );
            return Err(SagaError::Forbidden("You cannot use this category".to_string()));
        }

        Ok(Some(category))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

pub struct InMemoryCategoryStore {
    rows: RwLock<Vec<TransactionCategory>>,
}

impl InMemoryCategoryStore {
    /// Store holding the default global set with ids `1..=7`
    pub fn with_defaults() -> Self {
        let rows = DEFAULT_CATEGORIES
            .iter()
            .zip(1..)
            .map(|(name, id)| TransactionCategory {
                id,
                user_id: None,
                name: (*name).to_string(),
            })
            .collect();
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub async fn find_by_name(&self, name: &str) -> Option<TransactionCategory> {
        self.rows
            .read()
            .await
            .iter()
            .find(|c| c.is_global() && c.name == name)
            .cloned()
    }
}

#[async_trait]
impl CategoryStore for InMemoryCategoryStore {
    async fn find(&self, id: CategoryId) -> Result<Option<TransactionCategory>, SagaError> {
        Ok(self.rows.read().await.iter().find(|c| c.id == id).cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<TransactionCategory>, SagaError> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|c| c.usable_by(user_id))
            .cloned()
            .collect())
    }

    async fn insert(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<TransactionCategory>, SagaError> {
        let mut rows = self.rows.write().await;
        if rows
            .iter()
            .any(|c| c.user_id == Some(user_id) && c.name == name)
        {
            return Ok(None);
        }

        let id = rows.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        let category = TransactionCategory {
            id,
            user_id: Some(user_id),
            name: name.to_string(),
        };
        rows.push(category.clone());
        Ok(Some(category))
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

pub struct PgCategoryStore {
    pool: PgPool,
}

impl PgCategoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_category(row: &sqlx::postgres::PgRow) -> TransactionCategory {
        TransactionCategory {
            id: row.get("category_id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
        }
    }
}

#[async_trait]
impl CategoryStore for PgCategoryStore {
    async fn find(&self, id: CategoryId) -> Result<Option<TransactionCategory>, SagaError> {
        let row = sqlx::query(
            "SELECT category_id, user_id, name FROM transaction_categories_tb WHERE category_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_category))
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<TransactionCategory>, SagaError> {
        let rows = sqlx::query(
            r#"
            SELECT category_id, user_id, name FROM transaction_categories_tb
            WHERE user_id IS NULL OR user_id = $1
            ORDER BY category_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_category).collect())
    }

    async fn insert(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<TransactionCategory>, SagaError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transaction_categories_tb (user_id, name)
            VALUES ($1, $2)
            RETURNING category_id, user_id, name
            "#,
        )
        .bind(user_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(Some(Self::row_to_category(&row))),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (Arc<InMemoryCategoryStore>, CategoryService) {
        let store = Arc::new(InMemoryCategoryStore::with_defaults());
        (store.clone(), CategoryService::new(store))
    }

    #[tokio::test]
    async fn test_deposit_ignores_category() {
        let (_, svc) = service();
        assert_eq!(svc.resolve(Some(999), 1, OperationType::Deposit).await, Ok(None));
        assert_eq!(svc.resolve(None, 1, OperationType::Deposit).await, Ok(None));
    }

    #[tokio::test]
    async fn test_missing_or_unknown_category_is_bad_request() {
        let (_, svc) = service();
        assert!(matches!(
            svc.resolve(None, 1, OperationType::Transfer).await,
            Err(SagaError::BadRequest(_))
        ));
        assert!(matches!(
            svc.resolve(Some(999), 1, OperationType::Withdraw).await,
            Err(SagaError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_global_and_own_categories_resolve() {
        let (store, svc) = service();
        let food = store.find_by_name("FOOD").await.unwrap();
        let resolved = svc
            .resolve(Some(food.id), 42, OperationType::Transfer)
            .await
            .unwrap();
        assert_eq!(resolved, Some(food));

        let own = svc.create_custom("Gifts", 42).await.unwrap();
        let resolved = svc
            .resolve(Some(own.id), 42, OperationType::Withdraw)
            .await
            .unwrap();
        assert_eq!(resolved.map(|c| c.name), Some("Gifts".to_string()));
    }

    #[tokio::test]
    async fn test_foreign_private_category_is_forbidden() {
        let (_, svc) = service();
        let own = svc.create_custom("Gifts", 42).await.unwrap();
        assert!(matches!(
            svc.resolve(Some(own.id), 7, OperationType::Transfer).await,
            Err(SagaError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_create_custom_rejects_duplicates_and_blank() {
        let (_, svc) = service();
        svc.create_custom("Gifts", 42).await.unwrap();
        assert!(matches!(
            svc.create_custom("Gifts", 42).await,
            Err(SagaError::BadRequest(_))
        ));
        assert!(svc.create_custom("Gifts", 43).await.is_ok());
        assert!(matches!(
            svc.create_custom("   ", 42).await,
            Err(SagaError::BadRequest(_))
        ));

        let visible = svc.list_for_user(42).await.unwrap();
        assert_eq!(visible.len(), DEFAULT_CATEGORIES.len() + 1);
    }
}
