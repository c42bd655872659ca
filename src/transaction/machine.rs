//! Transaction State Machine
//!
//! Owns every status change of a transaction record. Each transition is a
//! conditional update that matches on `status == pending`, so concurrent or
//! retried callers cannot apply a transition twice or reverse one.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state::{TransactionKind, TransactionStatus};
use super::types::{Confirmation, Transaction, fields};
use crate::error::LedgerError;
use crate::policy::{ReadClass, StoragePolicy, WriteClass};
use crate::store::{DocumentStore, Filter, TRANSACTIONS, Update};

/// Guarded status transitions for transaction records
pub struct TransactionStateMachine {
    store: Arc<dyn DocumentStore>,
    policy: StoragePolicy,
}

impl TransactionStateMachine {
    pub fn new(store: Arc<dyn DocumentStore>, policy: StoragePolicy) -> Self {
        Self { store, policy }
    }

    /// Insert a record built by the caller, in whatever state it carries
    pub async fn record(&self, tx: &Transaction) -> Result<(), LedgerError> {
        self.store
            .insert(
                TRANSACTIONS,
                tx.to_document(),
                self.policy.write_level(WriteClass::Financial),
            )
            .await?;
        Ok(())
    }

    /// Insert a `pending` record to be settled by a later `confirm`/`fail`
    pub async fn create_pending(
        &self,
        from: &str,
        to: &str,
        value: Decimal,
        kind: TransactionKind,
    ) -> Result<Transaction, LedgerError> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        let tx = Transaction::new(from, to, value, kind, TransactionStatus::Pending);
        self.record(&tx).await?;
        debug!(tx_hash = %tx.tx_hash, kind = %kind, "Pending transaction created");
        Ok(tx)
    }

    /// `pending → confirmed`
    ///
    /// Returns `AlreadyFinalized` if no pending record with this hash exists.
    pub async fn confirm(
        &self,
        tx_hash: &str,
        confirmation: Option<Confirmation>,
    ) -> Result<(), LedgerError> {
        let mut update = Update::new()
            .set(fields::STATUS, TransactionStatus::Confirmed.as_str())
            .set(fields::CONFIRMED_AT, Utc::now());
        if let Some(c) = confirmation {
            update = update
                .set(fields::BLOCK_NUMBER, c.block_number)
                .set(fields::GAS_USED, c.gas_used)
                .set(fields::GAS_PRICE, c.gas_price);
        }
        self.transition(tx_hash, TransactionStatus::Confirmed, update)
            .await
    }

    /// `pending → failed`
    pub async fn fail(&self, tx_hash: &str, reason: Option<&str>) -> Result<(), LedgerError> {
        let update = Update::new()
            .set(fields::STATUS, TransactionStatus::Failed.as_str())
            .set(fields::FAILED_AT, Utc::now())
            .set(fields::ERROR, reason);
        self.transition(tx_hash, TransactionStatus::Failed, update)
            .await
    }

    async fn transition(
        &self,
        tx_hash: &str,
        target: TransactionStatus,
        update: Update,
    ) -> Result<(), LedgerError> {
        let filter = Filter::eq(fields::TX_HASH, tx_hash)
            .and(Filter::eq(fields::STATUS, TransactionStatus::Pending.as_str()));

        let result = self
            .store
            .update_one(
                TRANSACTIONS,
                &filter,
                &update,
                self.policy.write_level(WriteClass::Financial),
            )
            .await?;

        if result.modified == 0 {
            debug!(tx_hash, target = %target, "Transition matched no pending record");
            return Err(LedgerError::AlreadyFinalized {
                id: tx_hash.to_string(),
            });
        }

        info!(tx_hash, status = %target, "Transaction finalized");
        Ok(())
    }

    /// Fail every pending transaction created before `threshold`
    ///
    /// Reconciliation sweep; returns how many records moved to `failed`.
    pub async fn mark_stale_pending_as_failed(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let filter = Filter::eq(fields::STATUS, TransactionStatus::Pending.as_str())
            .and(Filter::lt(fields::CREATED_AT, threshold));
        let update = Update::new()
            .set(fields::STATUS, TransactionStatus::Failed.as_str())
            .set(fields::FAILED_AT, Utc::now())
            .set(fields::ERROR, "stale pending transaction");

        let result = self
            .store
            .update_many(
                TRANSACTIONS,
                &filter,
                &update,
                self.policy.write_level(WriteClass::Financial),
            )
            .await?;

        if result.modified > 0 {
            warn!(
                count = result.modified,
                threshold = %threshold,
                "Stale pending transactions marked failed"
            );
        }
        Ok(result.modified)
    }

    pub async fn find_by_tx_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, LedgerError> {
        let doc = self
            .store
            .find_one(
                TRANSACTIONS,
                &Filter::eq(fields::TX_HASH, tx_hash),
                self.policy.read_level(ReadClass::Financial),
            )
            .await?;
        doc.as_ref().map(Transaction::from_document).transpose()
    }
}
