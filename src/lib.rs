//! Wallet Ledger - consistent balance transfers on a per-document-atomic store
//!
//! # Modules
//!
//! - [`policy`] - Write acknowledgement / read freshness per operation class
//! - [`store`] - Storage port, document model, in-memory store
//! - [`transfer`] - Single-step transfer with compensation
//! - [`two_phase`] - Intent-log transfer with crash recovery
//! - [`transaction`] - Transaction records and their status machine
//! - [`watcher`] - Resumable transaction change feed subscriptions
//! - [`config`] / [`logging`] / [`db`] - Service plumbing

// Configuration and plumbing
pub mod config;
pub mod db;
pub mod error;
pub mod logging;

// Storage
pub mod policy;
pub mod store;

// Ledger components
pub mod transaction;
pub mod transfer;
pub mod two_phase;
pub mod watcher;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use error::LedgerError;
pub use policy::{ReadLevel, StoragePolicy, WriteLevel};
pub use store::{DocumentStore, MemoryStore, StoreError};
pub use transaction::{Transaction, TransactionStateMachine, TransactionStatus};
pub use transfer::{AccountReader, ActivityLog, TransferCoordinator, TransferResult};
pub use two_phase::{PendingTransfer, RecoveryWorker, TwoPhaseCommitCoordinator};
pub use watcher::{ChangeWatcher, SubscriptionHandle, TransactionHandler, WatcherStatus};
