//! Transaction Saga
//!
//! Drives transfers, deposits and withdrawals against the [`Ledger`] with
//! exactly-once economic effect across retries, crashes and duplicate
//! requests.
//!
//! # State Machine
//!
//! ```text
//! CREATED → PROCESSING → COMPLETED
//!               ↓
//!            FAILED (compensation: NONE | SUCCEEDED | FAILED)
//! ```
//!
//! Transfers additionally persist `step`: NONE → DEBIT_DONE → CREDIT_DONE.
//!
//! # Safety Invariants
//!
//! 1. **Unique key**: the `idempotency_key` constraint admits one saga per key
//! 2. **Forward-only step**: `step` never regresses, so resumption never repeats a debit
//! 3. **Idempotent ledger**: every mutation is keyed by `(operation_id, account_id)`
//! 4. **Terminal is final**: COMPLETED and FAILED records are never written again
//!
//! [`Ledger`]: crate::ledger::Ledger

pub mod coordinator;
pub mod db;
pub mod error;
pub mod state;
pub mod store;
pub mod strategy;
pub mod types;
pub mod worker;


pub use coordinator::{RecoveryOutcome, TransactionService};
pub use db::PgTransactionStore;
pub use error::{ErrorKind, SagaError};
pub use state::{CompensationStatus, OperationType, TransactionStatus, TransactionStep};
pub use store::{InMemoryTransactionStore, InsertOutcome, TransactionStore};
pub use strategy::FinancialOperation;
pub use types::{
    DepositRequest, Page, PageRequest, TransactionId, TransactionRecord, TransactionView,
    TransferRequest, WithdrawRequest,
};
pub use worker::{RecoveryHandle, RecoveryWorker, ScanReport, WorkerConfig};
