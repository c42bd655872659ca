//! Two-Phase Transfer
//!
//! Intent-log-plus-recovery protocol for moving value when the store cannot
//! update two documents atomically.
//!
//! # Safety Invariants
//!
//! 1. **Intent First**: the `PendingTransfer` record exists before any
//!    balance changes
//! 2. **Markers Mirror Legs**: an account holds the transfer id in its
//!    `pendingTransfers` set exactly while that leg is applied and uncommitted
//! 3. **Status Guards Everything**: every intent transition matches on
//!    `status == pending`, so live commits and recovery passes never
//!    double-apply

pub mod coordinator;
pub mod recovery;
pub mod state;
pub mod types;

pub use coordinator::TwoPhaseCommitCoordinator;
pub use recovery::{RecoveryWorker, ScanOutcome, WorkerConfig};
pub use state::PendingTransferStatus;
pub use types::{PendingTransfer, RecoveryReport};
