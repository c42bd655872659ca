//! Transaction Record Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::state::{TransactionKind, TransactionStatus};
use crate::error::LedgerError;
use crate::store::{Document, ID_FIELD, Value};

/// Stored field names
pub mod fields {
    pub const TX_HASH: &str = "txHash";
    pub const FROM: &str = "from";
    pub const TO: &str = "to";
    pub const VALUE: &str = "value";
    pub const STATUS: &str = "status";
    pub const KIND: &str = "type";
    pub const CREATED_AT: &str = "createdAt";
    pub const CONFIRMED_AT: &str = "confirmedAt";
    pub const FAILED_AT: &str = "failedAt";
    pub const BLOCK_NUMBER: &str = "blockNumber";
    pub const GAS_USED: &str = "gasUsed";
    pub const GAS_PRICE: &str = "gasPrice";
    pub const ERROR: &str = "error";
}

/// Generate a 32-byte hex transaction hash (`0x` + 64 hex chars)
pub fn new_tx_hash() -> String {
    format!(
        "0x{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// On-chain confirmation details, for transactions settled externally
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Confirmation {
    pub block_number: Option<i64>,
    pub gas_used: Option<i64>,
    pub gas_price: Option<Decimal>,
}

/// A transaction record
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub value: Decimal,
    pub status: TransactionStatus,
    pub kind: TransactionKind,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmation: Confirmation,
    pub error: Option<String>,
}

impl Transaction {
    /// New record with a fresh hash; `_id` is the hash
    pub fn new(
        from: &str,
        to: &str,
        value: Decimal,
        kind: TransactionKind,
        status: TransactionStatus,
    ) -> Self {
        let tx_hash = new_tx_hash();
        let now = Utc::now();
        Self {
            id: tx_hash.clone(),
            tx_hash,
            from: from.to_string(),
            to: to.to_string(),
            value,
            status,
            kind,
            created_at: now,
            confirmed_at: (status == TransactionStatus::Confirmed).then_some(now),
            confirmation: Confirmation::default(),
            error: None,
        }
    }

    pub fn to_document(&self) -> Document {
        use fields::*;
        Document::new()
            .with(ID_FIELD, self.id.as_str())
            .with(TX_HASH, self.tx_hash.as_str())
            .with(FROM, self.from.as_str())
            .with(TO, self.to.as_str())
            .with(VALUE, self.value)
            .with(STATUS, self.status.as_str())
            .with(KIND, self.kind.as_str())
            .with(CREATED_AT, self.created_at)
            .with(CONFIRMED_AT, self.confirmed_at)
            .with(BLOCK_NUMBER, self.confirmation.block_number)
            .with(GAS_USED, self.confirmation.gas_used)
            .with(GAS_PRICE, self.confirmation.gas_price)
            .with(ERROR, self.error.clone())
    }

    pub fn from_document(doc: &Document) -> Result<Self, LedgerError> {
        use fields::*;

        let id = doc
            .id()
            .ok_or_else(|| LedgerError::MalformedDocument("transaction without _id".into()))?;
        let field = |name: &str| {
            doc.get_str(name).ok_or_else(|| {
                LedgerError::MalformedDocument(format!("transaction {id}: missing {name}"))
            })
        };

        let status = field(STATUS)?
            .parse::<TransactionStatus>()
            .map_err(LedgerError::MalformedDocument)?;
        let kind = match doc.get_str(KIND) {
            Some(k) => k.parse().map_err(LedgerError::MalformedDocument)?,
            None => TransactionKind::Send,
        };
        let value = doc.get_decimal(VALUE).ok_or_else(|| {
            LedgerError::MalformedDocument(format!("transaction {id}: missing {VALUE}"))
        })?;
        let created_at = doc.get_time(CREATED_AT).ok_or_else(|| {
            LedgerError::MalformedDocument(format!("transaction {id}: missing {CREATED_AT}"))
        })?;

        Ok(Self {
            id: id.to_string(),
            tx_hash: field(TX_HASH)?.to_string(),
            from: field(FROM)?.to_string(),
            to: field(TO)?.to_string(),
            value,
            status,
            kind,
            created_at,
            confirmed_at: doc.get_time(CONFIRMED_AT),
            confirmation: Confirmation {
                block_number: doc.get_int(BLOCK_NUMBER),
                gas_used: doc.get_int(GAS_USED),
                gas_price: doc.get_decimal(GAS_PRICE),
            },
            error: doc.get(ERROR).and_then(Value::as_str).map(str::to_string),
        })
    }
}
