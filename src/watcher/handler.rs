//! Transaction Handlers
//!
//! Delivery is at-least-once: a handler may see the same transaction and
//! status more than once after a restart or reconnect, and must treat
//! `(tx_hash, status)` as its idempotency key.

use async_trait::async_trait;

use super::event::TransactionEvent;
use crate::transaction::Transaction;

/// Callbacks for transaction changes; unimplemented callbacks do nothing
///
/// Returning `Err` makes the watcher resubscribe from the last cursor,
/// which redelivers the event.
#[async_trait]
pub trait TransactionHandler: Send + Sync {
    async fn on_new_transaction(&self, _tx: &Transaction) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_confirmed(&self, _tx: &Transaction) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_failed(&self, _tx: &Transaction) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Route a classified event to the matching callback
pub async fn dispatch(
    handler: &dyn TransactionHandler,
    event: &TransactionEvent,
) -> anyhow::Result<()> {
    match event {
        TransactionEvent::Created(tx) => handler.on_new_transaction(tx).await,
        TransactionEvent::Confirmed(tx) => handler.on_confirmed(tx).await,
        TransactionEvent::Failed(tx) => handler.on_failed(tx).await,
    }
}
