//! Transfer Result Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// A completed transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferResult {
    /// Hash of the transaction record written for this transfer
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub confirmed_at: DateTime<Utc>,
}
