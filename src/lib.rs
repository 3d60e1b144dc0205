//! Transaction Saga Orchestrator
//!
//! Moves money between accounts held by a separate ledger without
//! distributed transactions: a persisted saga record, forward-only steps,
//! idempotent ledger mutations and a recovery sweep.
//!
//! # Modules
//!
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup
//! - [`db`] - PostgreSQL pool and schemas
//! - [`money`] - Currency codes and 2-decimal amount rules
//! - [`ledger`] - Idempotent debit/credit ledger (in-memory and PostgreSQL)
//! - [`rates`] - Exchange rates with a TTL cache
//! - [`limits`] - Per-user single and rolling-24h spending limits
//! - [`category`] - Transaction categories
//! - [`saga`] - Orchestrator, strategies, store and recovery worker

pub mod category;
pub mod config;
pub mod db;
pub mod ledger;
pub mod limits;
pub mod logging;
pub mod money;
pub mod rates;
pub mod saga;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use ledger::{AccountId, InMemoryLedger, Ledger, LedgerError, OperationId, PgLedger, UserId};
pub use money::Currency;
pub use saga::{
    RecoveryWorker, SagaError, TransactionService, TransactionStatus, TransactionStep,
    TransactionView,
};
