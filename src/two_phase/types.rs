//! Pending Transfer Record

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::state::PendingTransferStatus;
use crate::error::LedgerError;
use crate::store::{Document, ID_FIELD, Value};

/// Stored field names
pub mod fields {
    pub const FROM: &str = "from";
    pub const TO: &str = "to";
    pub const AMOUNT: &str = "amount";
    pub const STATUS: &str = "status";
    pub const CREATED_AT: &str = "createdAt";
    pub const COMPLETED_AT: &str = "completedAt";
    pub const FAILED_AT: &str = "failedAt";
    pub const ERROR: &str = "error";
    pub const MARKERS_RELEASED: &str = "markersReleased";
}

/// Durable intent for one two-phase transfer
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransfer {
    /// ULID; also the marker pushed onto both accounts' in-flight sets
    pub id: String,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub status: PendingTransferStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Set once both accounts are known to no longer hold the marker
    pub markers_released: bool,
}

impl PendingTransfer {
    pub fn new(from: &str, to: &str, amount: Decimal) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            status: PendingTransferStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            error: None,
            markers_released: false,
        }
    }

    pub fn to_document(&self) -> Document {
        use fields::*;
        Document::new()
            .with(ID_FIELD, self.id.as_str())
            .with(FROM, self.from.as_str())
            .with(TO, self.to.as_str())
            .with(AMOUNT, self.amount)
            .with(STATUS, self.status.as_str())
            .with(CREATED_AT, self.created_at)
            .with(COMPLETED_AT, self.completed_at)
            .with(FAILED_AT, self.failed_at)
            .with(ERROR, self.error.clone())
            .with(MARKERS_RELEASED, self.markers_released)
    }

    pub fn from_document(doc: &Document) -> Result<Self, LedgerError> {
        use fields::*;

        let id = doc
            .id()
            .ok_or_else(|| LedgerError::MalformedDocument("pending transfer without _id".into()))?;
        let missing = |name: &str| {
            LedgerError::MalformedDocument(format!("pending transfer {id}: missing {name}"))
        };

        Ok(Self {
            id: id.to_string(),
            from: doc.get_str(FROM).ok_or_else(|| missing(FROM))?.to_string(),
            to: doc.get_str(TO).ok_or_else(|| missing(TO))?.to_string(),
            amount: doc.get_decimal(AMOUNT).ok_or_else(|| missing(AMOUNT))?,
            status: doc
                .get_str(STATUS)
                .ok_or_else(|| missing(STATUS))?
                .parse()
                .map_err(LedgerError::MalformedDocument)?,
            created_at: doc.get_time(CREATED_AT).ok_or_else(|| missing(CREATED_AT))?,
            completed_at: doc.get_time(COMPLETED_AT),
            failed_at: doc.get_time(FAILED_AT),
            error: doc.get(ERROR).and_then(Value::as_str).map(str::to_string),
            markers_released: doc.get(MARKERS_RELEASED) == Some(&Value::Bool(true)),
        })
    }
}

/// Outcome of one recovery scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Stale pending intents examined
    pub scanned: usize,
    /// Driven to `completed`
    pub completed: usize,
    /// Driven to `failed`
    pub failed: usize,
    /// Left pending (storage error, anomaly, or lost a race)
    pub skipped: usize,
    /// Finalized intents whose leftover markers or legs were cleaned up
    pub released: usize,
}

impl RecoveryReport {
    pub fn resolved(&self) -> usize {
        self.completed + self.failed
    }
}
