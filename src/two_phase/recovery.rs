//! Recovery Worker
//!
//! Background worker that drives stuck two-phase transfers to a terminal
//! state and sweeps stale pending transaction records.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::coordinator::{TwoPhaseCommitCoordinator, cutoff};
use super::types::RecoveryReport;
use crate::config::RecoveryConfig;
use crate::error::LedgerError;
use crate::transaction::TransactionStateMachine;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan
    pub scan_interval: Duration,
    /// How long an intent must be pending to be considered stuck
    pub stale_threshold: Duration,
    /// Maximum intents to process per scan
    pub batch_size: usize,
    /// Age after which a pending transaction record is failed
    pub stale_transaction_age: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for WorkerConfig {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.scan_interval_secs),
            stale_threshold: Duration::from_secs(config.stale_threshold_secs),
            batch_size: config.batch_size,
            stale_transaction_age: Duration::from_secs(config.stale_transaction_secs),
        }
    }
}

/// Outcome of one worker cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOutcome {
    pub transfers: RecoveryReport,
    /// Pending transaction records moved to `failed`
    pub stale_transactions: u64,
}

/// Recovery Worker
///
/// Periodically scans for pending transfer intents older than the stale
/// threshold and resumes them, then fails transaction records that stayed
/// pending past their own age limit.
pub struct RecoveryWorker {
    coordinator: Arc<TwoPhaseCommitCoordinator>,
    transactions: Arc<TransactionStateMachine>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(
        coordinator: Arc<TwoPhaseCommitCoordinator>,
        transactions: Arc<TransactionStateMachine>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            coordinator,
            transactions,
            config,
        }
    }

    /// Create with default configuration
    pub fn with_defaults(
        coordinator: Arc<TwoPhaseCommitCoordinator>,
        transactions: Arc<TransactionStateMachine>,
    ) -> Self {
        Self::new(coordinator, transactions, WorkerConfig::default())
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped
    ///
    /// A scan in progress finishes before the worker stops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        // interval() panics on a zero period
        let period = self.config.scan_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!(error = %e, "Recovery scan failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Recovery worker stopped");
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_once(&self) -> Result<ScanOutcome, LedgerError> {
        let transfers = self
            .coordinator
            .recover(self.config.stale_threshold, self.config.batch_size)
            .await?;

        let threshold = cutoff(self.config.stale_transaction_age)?;
        let stale_transactions = self
            .transactions
            .mark_stale_pending_as_failed(threshold)
            .await?;

        if transfers.scanned == 0 && transfers.released == 0 && stale_transactions == 0 {
            debug!("No stale work found");
        }
        Ok(ScanOutcome {
            transfers,
            stale_transactions,
        })
    }
}
