//! Change Event Classification
//!
//! | operation | status      | dispatched as |
//! |-----------|-------------|---------------|
//! | insert    | any         | `Created`     |
//! | update    | `confirmed` | `Confirmed`   |
//! | update    | `failed`    | `Failed`      |
//! | otherwise |             | ignored       |

use crate::error::LedgerError;
use crate::store::{ChangeEvent, OperationType};
use crate::transaction::{Transaction, TransactionStatus};

/// A transaction change worth dispatching
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    Created(Transaction),
    Confirmed(Transaction),
    Failed(Transaction),
}

impl TransactionEvent {
    pub fn transaction(&self) -> &Transaction {
        match self {
            TransactionEvent::Created(tx)
            | TransactionEvent::Confirmed(tx)
            | TransactionEvent::Failed(tx) => tx,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransactionEvent::Created(_) => "created",
            TransactionEvent::Confirmed(_) => "confirmed",
            TransactionEvent::Failed(_) => "failed",
        }
    }
}

/// Classify a raw change event; `Ok(None)` means ignore it
pub fn classify(event: &ChangeEvent) -> Result<Option<TransactionEvent>, LedgerError> {
    if !matches!(event.operation, OperationType::Insert | OperationType::Update) {
        return Ok(None);
    }
    let Some(doc) = &event.full_document else {
        return Ok(None);
    };
    let tx = Transaction::from_document(doc)?;

    Ok(match (event.operation, tx.status) {
        (OperationType::Insert, _) => Some(TransactionEvent::Created(tx)),
        (OperationType::Update, TransactionStatus::Confirmed) => {
            Some(TransactionEvent::Confirmed(tx))
        }
        (OperationType::Update, TransactionStatus::Failed) => Some(TransactionEvent::Failed(tx)),
        _ => None,
    })
}
