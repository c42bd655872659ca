//! Ledger Error Types
//!
//! One closed enumeration for every failure the transfer engine, the
//! two-phase coordinator, the transaction state machine and the change
//! watcher can report.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::store::StoreError;

/// Ledger error types
///
/// Codes are stable and meant for API responses and alert routing.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Source and target account cannot be the same")]
    SameAccount,

    // === Transfer Errors ===
    #[error("Insufficient balance or account not found: {account}")]
    InsufficientBalanceOrNotFound { account: String },

    #[error("Recipient not found: {account}")]
    RecipientNotFound { account: String },

    #[error("Compensation failed: {amount} owed back to {account}")]
    CompensationFailed { account: String, amount: Decimal },

    #[error("Balances moved but transaction record was not written: {tx_hash}")]
    UnrecordedTransfer { tx_hash: String },

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // === State Machine Errors ===
    #[error("Already finalized: {id}")]
    AlreadyFinalized { id: String },

    #[error("Orphaned pending transfer: {transfer_id}")]
    OrphanedPendingTransfer { transfer_id: String },

    // === Watcher Errors ===
    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("Watcher stopped after {failures} consecutive failures: {reason}")]
    WatcherFatal { failures: u32, reason: String },

    // === System Errors ===
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::SameAccount => "SAME_ACCOUNT",
            LedgerError::InsufficientBalanceOrNotFound { .. } => {
                "INSUFFICIENT_BALANCE_OR_NOT_FOUND"
            }
            LedgerError::RecipientNotFound { .. } => "RECIPIENT_NOT_FOUND",
            LedgerError::CompensationFailed { .. } => "COMPENSATION_FAILED",
            LedgerError::UnrecordedTransfer { .. } => "UNRECORDED_TRANSFER",
            LedgerError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            LedgerError::AlreadyFinalized { .. } => "ALREADY_FINALIZED",
            LedgerError::OrphanedPendingTransfer { .. } => "ORPHANED_PENDING_TRANSFER",
            LedgerError::SubscriptionLost(_) => "SUBSCRIPTION_LOST",
            LedgerError::WatcherFatal { .. } => "WATCHER_FATAL",
            LedgerError::MalformedDocument(_) => "MALFORMED_DOCUMENT",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// A declined transfer: nothing was mutated, or the mutation was undone.
    pub fn is_declined(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount
                | LedgerError::SameAccount
                | LedgerError::InsufficientBalanceOrNotFound { .. }
                | LedgerError::RecipientNotFound { .. }
        )
    }

    /// Balances may disagree with the transaction log; needs an operator.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            LedgerError::CompensationFailed { .. }
                | LedgerError::UnrecordedTransfer { .. }
                | LedgerError::WatcherFatal { .. }
        )
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

impl From<serde_yaml::Error> for LedgerError {
    fn from(e: serde_yaml::Error) -> Self {
        LedgerError::Config(e.to_string())
    }
}
