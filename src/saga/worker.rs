//! Recovery Worker
//!
//! Background sweep that re-drives transactions abandoned in CREATED or
//! PROCESSING, resuming from their persisted step.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::coordinator::{RecoveryOutcome, TransactionService};
use super::error::SagaError;
use crate::config::RecoveryConfig;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stuck transactions
    pub scan_interval: Duration,
    /// How long a non-terminal record must be untouched to count as abandoned
    pub processing_timeout: Duration,
    /// Maximum transactions to process per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for WorkerConfig {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.scan_interval_secs.max(1)),
            processing_timeout: Duration::from_secs(config.processing_timeout_secs),
            batch_size: config.batch_size,
        }
    }
}

/// Per-scan tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub found: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct RecoveryWorker {
    service: Arc<TransactionService>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(service: Arc<TransactionService>, config: WorkerConfig) -> Self {
        Self { service, config }
    }

    pub fn with_defaults(service: Arc<TransactionService>) -> Self {
        Self::new(service, WorkerConfig::default())
    }

    /// Start the periodic sweep on the runtime
    pub fn spawn(self) -> RecoveryHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        RecoveryHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            processing_timeout_secs = self.config.processing_timeout.as_secs(),
            "Starting recovery worker"
        );

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_and_recover().await {
                        error!(error = %e, "Recovery scan failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Recovery worker stopped");
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_and_recover(&self) -> Result<ScanReport, SagaError> {
        let timeout = chrono::Duration::from_std(self.config.processing_timeout)
            .map_err(|e| SagaError::Internal(format!("Invalid processing timeout: {}", e)))?;
        let cutoff = Utc::now() - timeout;

        let stuck = self
            .service
            .store()
            .find_stuck(cutoff, self.config.batch_size)
            .await?;

        let mut report = ScanReport {
            found: stuck.len(),
            ..ScanReport::default()
        };
        if stuck.is_empty() {
            debug!("No stuck transactions found");
            return Ok(report);
        }

        info!(count = stuck.len(), "Found stuck transactions to recover");

        for tx in &stuck {
            debug!(
                tx_id = tx.id,
                step = %tx.step,
                attempts = tx.attempts,
                "Recovering transaction"
            );

            match self.service.recover(tx).await {
                Ok(RecoveryOutcome::Completed) => report.completed += 1,
                Ok(RecoveryOutcome::Failed) => report.failed += 1,
                Ok(RecoveryOutcome::Deferred) => report.deferred += 1,
                Ok(RecoveryOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(tx_id = tx.id, error = %e, "Failed to recover transaction");
                }
            }
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            deferred = report.deferred,
            "Recovery scan finished"
        );
        Ok(report)
    }
}

/// Handle of a spawned [`RecoveryWorker`]
pub struct RecoveryHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RecoveryHandle {
    /// Signal the loop and wait for it to exit. An in-flight scan finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Recovery worker task panicked");
        }
    }
}
