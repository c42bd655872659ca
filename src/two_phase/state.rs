//! Pending Transfer Status
//!
//! ```text
//! (absent) → PENDING → COMPLETED
//!               ↓
//!            FAILED
//! ```
//!
//! The terminal status is the source of truth for whether the transfer
//! happened. Recovery only ever acts on `PENDING` intents.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingTransferStatus {
    /// Intent logged; balances may be partially applied
    Pending,
    /// Both legs applied (TERMINAL)
    Completed,
    /// Nothing applied, or every applied leg undone (TERMINAL)
    Failed,
}

impl PendingTransferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PendingTransferStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PendingTransferStatus::Pending => "pending",
            PendingTransferStatus::Completed => "completed",
            PendingTransferStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PendingTransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingTransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PendingTransferStatus::Pending),
            "completed" => Ok(PendingTransferStatus::Completed),
            "failed" => Ok(PendingTransferStatus::Failed),
            other => Err(format!("unknown pending transfer status: {other}")),
        }
    }
}
