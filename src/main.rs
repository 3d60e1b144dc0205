//! Transaction saga daemon
//!
//! Connects the transaction store and the ledger, then runs the recovery
//! worker until Ctrl+C.
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│ Transaction  │───▶│  Ledger  │
//! │  (YAML)  │    │   Service    │    │   (PG)   │
//! └──────────┘    └──────────────┘    └──────────┘
//!                        ▲
//!                 ┌──────┴───────┐
//!                 │   Recovery   │
//!                 │    Worker    │
//!                 └──────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use transfer_saga::category::{CategoryService, PgCategoryStore};
use transfer_saga::config::AppConfig;
use transfer_saga::db::{Database, schema};
use transfer_saga::ledger::PgLedger;
use transfer_saga::limits::{LimitGuard, PgLimitStore};
use transfer_saga::rates::{HttpRateProvider, RateConverter};
use transfer_saga::saga::{PgTransactionStore, RecoveryWorker, TransactionService, WorkerConfig};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = transfer_saga::logging::init_logging(&app_config);

    tracing::info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        "Starting transaction saga service"
    );

    let tx_db = Database::connect(&app_config.postgres_url)
        .await
        .context("Failed to connect to transaction database")?;
    schema::init_transaction_schema(tx_db.pool()).await?;

    let ledger_db = Database::connect(app_config.ledger_url())
        .await
        .context("Failed to connect to ledger database")?;
    ledger_db
        .health_check()
        .await
        .context("Ledger database health check failed")?;
    schema::init_ledger_schema(ledger_db.pool()).await?;

    let ledger = Arc::new(PgLedger::new(
        ledger_db.pool().clone(),
        Duration::from_millis(app_config.ledger.lock_timeout_ms),
    ));
    let store = Arc::new(PgTransactionStore::new(tx_db.pool().clone()));

    let provider =
        HttpRateProvider::new(&app_config.rates).context("Failed to create rate provider")?;
    let rates = Arc::new(RateConverter::new(
        Arc::new(provider),
        app_config.rates.ttl_secs,
    ));
    let limits = Arc::new(LimitGuard::new(
        Arc::new(PgLimitStore::new(tx_db.pool().clone())),
        store.clone(),
        app_config.limits.clone(),
    ));
    let categories = Arc::new(CategoryService::new(Arc::new(PgCategoryStore::new(
        tx_db.pool().clone(),
    ))));

    let service = Arc::new(TransactionService::new(
        ledger,
        store,
        rates,
        limits,
        categories,
        app_config.saga.clone(),
    ));

    let worker = RecoveryWorker::new(service, WorkerConfig::from(&app_config.recovery));
    let handle = worker.spawn();

    tracing::info!("Service ready, press Ctrl+C to shutdown");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
