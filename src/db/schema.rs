use anyhow::Result;
use sqlx::PgPool;

use crate::category::DEFAULT_CATEGORIES;

/// Account-service side: balances and the idempotency anchor
pub async fn init_ledger_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing ledger schema...");

    for ddl in [CREATE_ACCOUNTS_TABLE, CREATE_APPLIED_TRANSACTIONS_TABLE] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("{}: {}", "Failed to create ledger table", e))?;
    }

    Ok(())
}

/// Transaction-service side: saga records, limits, categories
pub async fn init_transaction_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing transaction schema...");

    for ddl in [
        CREATE_CATEGORIES_TABLE,
        CREATE_TRANSACTIONS_TABLE,
        CREATE_TRANSACTIONS_STATUS_INDEX,
        CREATE_TRANSACTIONS_SOURCE_INDEX,
        CREATE_TRANSACTIONS_TARGET_INDEX,
        CREATE_LIMITS_TABLE,
    ] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("{}: {}", "Failed to create transaction table", e))?;
    }

    seed_default_categories(pool).await?;
    Ok(())
}

async fn seed_default_categories(pool: &PgPool) -> Result<()> {
    let mut seeded = 0u64;
    for name in DEFAULT_CATEGORIES {
        let result = sqlx::query(
            r#"
            INSERT INTO transaction_categories_tb (user_id, name)
            SELECT NULL, $1::VARCHAR
            WHERE NOT EXISTS (
                SELECT 1 FROM transaction_categories_tb WHERE user_id IS NULL AND name = $1
            )
            "#,
        )
        .bind(name)
        .execute(pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to seed category {}: {}", name, e))?;
        seeded += result.rows_affected();
    }

    if seeded > 0 {
        tracing::info!(count = seeded, "Seeded global categories");
    }
    Ok(())
}

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts_tb (
    account_id  BIGSERIAL PRIMARY KEY,
    owner_id    BIGINT NOT NULL,
    currency    VARCHAR(3) NOT NULL,
    balance     NUMERIC(19, 4) NOT NULL DEFAULT 0 CHECK (balance >= 0),
    status      SMALLINT NOT NULL DEFAULT 1,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

// The primary key is what makes debit/credit at-most-once
const CREATE_APPLIED_TRANSACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS applied_transactions_tb (
    operation_id  VARCHAR(64) NOT NULL,
    account_id    BIGINT NOT NULL REFERENCES accounts_tb (account_id),
    amount        NUMERIC(19, 4) NOT NULL,
    applied_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (operation_id, account_id)
)
"#;

const CREATE_CATEGORIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transaction_categories_tb (
    category_id  BIGSERIAL PRIMARY KEY,
    user_id      BIGINT,
    name         VARCHAR(64) NOT NULL,
    UNIQUE (user_id, name)
)
"#;

const CREATE_TRANSACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transactions_tb (
    tx_id              BIGSERIAL PRIMARY KEY,
    user_id            BIGINT NOT NULL,
    source_account_id  BIGINT,
    target_account_id  BIGINT,
    amount             NUMERIC(19, 4) NOT NULL,
    target_amount      NUMERIC(19, 4) NOT NULL,
    exchange_rate      NUMERIC(19, 8) NOT NULL,
    currency           VARCHAR(3) NOT NULL,
    status             SMALLINT NOT NULL,
    step               SMALLINT NOT NULL DEFAULT 0,
    compensation       SMALLINT NOT NULL DEFAULT 0,
    operation_type     SMALLINT NOT NULL,
    category_id        BIGINT REFERENCES transaction_categories_tb (category_id),
    idempotency_key    VARCHAR(128) NOT NULL UNIQUE,
    attempts           INT NOT NULL DEFAULT 0,
    error_message      TEXT,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_TRANSACTIONS_STATUS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_transactions_status_updated
    ON transactions_tb (status, updated_at)
"#;

const CREATE_TRANSACTIONS_SOURCE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_transactions_source
    ON transactions_tb (source_account_id, created_at DESC)
"#;

const CREATE_TRANSACTIONS_TARGET_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_transactions_target
    ON transactions_tb (target_account_id, created_at DESC)
"#;

const CREATE_LIMITS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transaction_limits_tb (
    user_id       BIGINT PRIMARY KEY,
    daily_limit   NUMERIC(19, 4) NOT NULL,
    single_limit  NUMERIC(19, 4) NOT NULL
)
"#;
