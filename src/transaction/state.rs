//! Transaction Status Definitions
//!
//! `pending → confirmed` and `pending → failed` are the only transitions.

use std::fmt;
use std::str::FromStr;

/// Transaction lifecycle status
///
/// Terminal states: CONFIRMED, FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Confirmed | TransactionStatus::Failed)
    }

    /// Whether `self → next` is a legal transition
    #[inline]
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        *self == TransactionStatus::Pending && next.is_terminal()
    }

    /// Stored string form
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "confirmed" => Ok(TransactionStatus::Confirmed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// Transaction kind, recorded for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Send,
    Receive,
    Swap,
    Approve,
    Mint,
    Bridge,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Send => "send",
            TransactionKind::Receive => "receive",
            TransactionKind::Swap => "swap",
            TransactionKind::Approve => "approve",
            TransactionKind::Mint => "mint",
            TransactionKind::Bridge => "bridge",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(TransactionKind::Send),
            "receive" => Ok(TransactionKind::Receive),
            "swap" => Ok(TransactionKind::Swap),
            "approve" => Ok(TransactionKind::Approve),
            "mint" => Ok(TransactionKind::Mint),
            "bridge" => Ok(TransactionKind::Bridge),
            other => Err(format!("unknown transaction kind: {other}")),
        }
    }
}
