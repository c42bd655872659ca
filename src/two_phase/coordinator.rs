//! Two-Phase Transfer Coordinator
//!
//! Intent-log transfer for stores without cross-document atomicity.
//!
//! ```text
//! prepare:  insert PendingTransfer{pending}
//! execute:  from.balance -= amount, from.pendingTransfers += id   (balance >= amount)
//!           to.balance   += amount, to.pendingTransfers   += id
//! commit:   PendingTransfer{completed}, then pull id from `from`, then from `to`
//! ```
//!
//! Every leg is a conditional update keyed on in-flight set membership, so
//! retried legs and concurrent recovery passes apply each leg at most once.
//! The membership of `id` in the two accounts is what recovery reads to
//! decide how far a crashed transfer got.
//!
//! Finalized intents carry `markersReleased`. Until it is set, recovery
//! keeps revisiting them: completed intents get their markers pulled, failed
//! intents get any leg that landed after the failure undone. An execute
//! stalled for longer than the staleness threshold after that sweep can
//! still land a leg; its own re-read of the intent then undoes it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::state::PendingTransferStatus;
use super::types::{PendingTransfer, RecoveryReport, fields};
use crate::error::LedgerError;
use crate::policy::{ReadClass, StoragePolicy, WriteClass, WriteLevel};
use crate::store::{DocumentStore, Filter, PENDING_TRANSFERS, StoreError, USERS, Update};
use crate::transfer::account::{self, Account, by_key};
use crate::transfer::coordinator::validate;
use crate::transfer::types::TransferResult;

/// Two-phase (intent, execute, commit) transfer coordinator
pub struct TwoPhaseCommitCoordinator {
    store: Arc<dyn DocumentStore>,
    policy: StoragePolicy,
}

impl TwoPhaseCommitCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, policy: StoragePolicy) -> Self {
        Self { store, policy }
    }

    /// Prepare, execute and commit in one call
    ///
    /// The returned `tx_hash` is the pending transfer id. A storage error
    /// after `prepare` leaves the intent `pending` for [`Self::recover`].
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<TransferResult, LedgerError> {
        let intent = self.prepare(from, to, amount).await?;
        let completed_at = async {
            self.execute(&intent).await?;
            self.commit(&intent).await
        }
        .instrument(info_span!("two_phase_transfer", transfer_id = %intent.id))
        .await?;

        Ok(TransferResult {
            tx_hash: intent.id,
            from: intent.from,
            to: intent.to,
            amount: intent.amount,
            confirmed_at: completed_at,
        })
    }

    /// Persist the intent before any balance is touched
    pub async fn prepare(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<PendingTransfer, LedgerError> {
        validate(from, to, amount)?;

        let intent = PendingTransfer::new(from, to, amount);
        self.store
            .insert(PENDING_TRANSFERS, intent.to_document(), self.write_level())
            .await?;

        info!(
            transfer_id = %intent.id,
            from,
            to,
            amount = %amount,
            "Transfer intent logged"
        );
        Ok(intent)
    }

    /// Apply both legs. Safe to call again for the same intent while it is
    /// pending; a finalized intent returns `AlreadyFinalized`, as does an
    /// intent that recovery failed while the legs were being applied (the
    /// legs are undone first).
    pub async fn execute(&self, intent: &PendingTransfer) -> Result<(), LedgerError> {
        let id = intent.id.as_str();
        let pending = self
            .load(id)
            .await?
            .is_some_and(|i| i.status == PendingTransferStatus::Pending);
        if !pending {
            return Err(LedgerError::AlreadyFinalized { id: id.to_string() });
        }

        let deducted = self
            .store
            .update_one(
                USERS,
                &by_key(&intent.from)
                    .and(Filter::gte(account::fields::BALANCE, intent.amount))
                    .and(Filter::not_contains(account::fields::PENDING_TRANSFERS, id)),
                &Update::new()
                    .inc(account::fields::BALANCE, -intent.amount)
                    .add_to_set(account::fields::PENDING_TRANSFERS, id),
                self.write_level(),
            )
            .await?;

        if deducted.modified == 0 {
            let already = self
                .account(&intent.from)
                .await?
                .is_some_and(|a| a.has_in_flight(id));
            if !already {
                self.mark_failed(id, "insufficient balance or account not found")
                    .await?;
                return Err(LedgerError::InsufficientBalanceOrNotFound {
                    account: intent.from.clone(),
                });
            }
            debug!(transfer_id = id, "Deduct already applied");
        }

        self.credit(intent).await?;

        let failed = self
            .load(id)
            .await?
            .is_some_and(|i| i.status == PendingTransferStatus::Failed);
        if failed {
            warn!(transfer_id = id, "Intent failed during execute, undoing applied legs");
            self.unwind(intent).await?;
            self.mark_released(id).await;
            return Err(LedgerError::AlreadyFinalized { id: id.to_string() });
        }
        Ok(())
    }

    /// Mark the intent completed, then release the in-flight markers
    ///
    /// Committing an already completed intent only repeats the cleanup. If
    /// the intent was failed concurrently, any applied legs are undone and
    /// `AlreadyFinalized` is returned. Once the status is `completed` the
    /// transfer has happened; a failed marker release is logged and left to
    /// recovery.
    pub async fn commit(&self, intent: &PendingTransfer) -> Result<DateTime<Utc>, LedgerError> {
        let now = Utc::now();
        let result = self
            .store
            .update_one(
                PENDING_TRANSFERS,
                &pending_intent(&intent.id),
                &Update::new()
                    .set(fields::STATUS, PendingTransferStatus::Completed.as_str())
                    .set(fields::COMPLETED_AT, now),
                self.write_level(),
            )
            .await?;

        let completed_at = if result.modified > 0 {
            now
        } else {
            let current = self
                .load(&intent.id)
                .await?
                .ok_or_else(|| LedgerError::TransferNotFound(intent.id.clone()))?;
            match current.status {
                PendingTransferStatus::Completed => current.completed_at.unwrap_or(now),
                PendingTransferStatus::Failed => {
                    warn!(transfer_id = %intent.id, "Commit raced a failure, undoing applied legs");
                    self.unwind(intent).await?;
                    self.mark_released(&intent.id).await;
                    return Err(LedgerError::AlreadyFinalized {
                        id: intent.id.clone(),
                    });
                }
                PendingTransferStatus::Pending => {
                    return Err(StoreError::Internal(format!(
                        "commit of {} matched no pending intent",
                        intent.id
                    ))
                    .into());
                }
            }
        };

        match self.release(intent).await {
            Ok(_) => self.mark_released(&intent.id).await,
            Err(e) => warn!(
                transfer_id = %intent.id,
                error = %e,
                "Marker release deferred to recovery"
            ),
        }
        info!(transfer_id = %intent.id, "Transfer committed");
        Ok(completed_at)
    }

    /// Drive every pending intent older than `older_than` to a terminal state,
    /// then clean up finalized intents of the same age whose markers were
    /// never confirmed released
    ///
    /// Safe to run concurrently with live transfers and with other recovery
    /// passes. Per-intent failures are logged and counted as skipped.
    pub async fn recover(
        &self,
        older_than: Duration,
        batch_size: usize,
    ) -> Result<RecoveryReport, LedgerError> {
        let cutoff = cutoff(older_than)?;
        let stale = self
            .store
            .find(
                PENDING_TRANSFERS,
                &Filter::eq(fields::STATUS, PendingTransferStatus::Pending.as_str())
                    .and(Filter::lt(fields::CREATED_AT, cutoff)),
                self.policy.read_level(ReadClass::Financial),
            )
            .await?;

        let mut report = RecoveryReport::default();
        for doc in stale.iter().take(batch_size) {
            report.scanned += 1;
            let intent = match PendingTransfer::from_document(doc) {
                Ok(intent) => intent,
                Err(e) => {
                    error!(error = %e, "Skipping unreadable pending transfer");
                    report.skipped += 1;
                    continue;
                }
            };

            let signal = LedgerError::OrphanedPendingTransfer {
                transfer_id: intent.id.clone(),
            };
            warn!(
                transfer_id = %intent.id,
                code = signal.code(),
                age_ms = (Utc::now() - intent.created_at).num_milliseconds(),
                "{signal}"
            );

            match self.recover_one(&intent).await {
                Ok(Some(PendingTransferStatus::Completed)) => report.completed += 1,
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(transfer_id = %intent.id, error = %e, "Failed to recover transfer");
                    report.skipped += 1;
                }
            }
        }

        self.reconcile_finalized(cutoff, batch_size, &mut report).await?;

        if report.scanned > 0 || report.released > 0 {
            info!(
                scanned = report.scanned,
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                released = report.released,
                "Recovery scan finished"
            );
        }
        Ok(report)
    }

    /// Pull leftover markers of completed intents and undo late legs of
    /// failed ones, then flag the intent released
    ///
    /// `cutoff` is taken before this pass failed anything, so an intent failed
    /// by the pass itself waits for the next one.
    async fn reconcile_finalized(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: usize,
        report: &mut RecoveryReport,
    ) -> Result<(), LedgerError> {
        let completed = Filter::eq(fields::STATUS, PendingTransferStatus::Completed.as_str())
            .and(Filter::lt(fields::COMPLETED_AT, cutoff));
        let failed = Filter::eq(fields::STATUS, PendingTransferStatus::Failed.as_str())
            .and(Filter::lt(fields::FAILED_AT, cutoff));
        let unreleased = self
            .store
            .find(
                PENDING_TRANSFERS,
                &Filter::eq(fields::MARKERS_RELEASED, false).and(completed.or(failed)),
                self.policy.read_level(ReadClass::Financial),
            )
            .await?;

        for doc in unreleased.iter().take(batch_size) {
            let intent = match PendingTransfer::from_document(doc) {
                Ok(intent) => intent,
                Err(e) => {
                    error!(error = %e, "Skipping unreadable finalized transfer");
                    continue;
                }
            };
            let cleaned = match intent.status {
                PendingTransferStatus::Completed => self.release(&intent).await,
                PendingTransferStatus::Failed => self.unwind(&intent).await,
                PendingTransferStatus::Pending => continue,
            };
            match cleaned {
                Ok(changed) => {
                    if changed {
                        warn!(
                            transfer_id = %intent.id,
                            status = intent.status.as_str(),
                            "Leftover transfer markers cleaned up"
                        );
                        report.released += 1;
                    }
                    self.mark_released(&intent.id).await;
                }
                Err(e) => error!(
                    transfer_id = %intent.id,
                    error = %e,
                    "Failed to clean up finalized transfer"
                ),
            }
        }
        Ok(())
    }

    /// Terminal status this pass drove the intent to, if any
    async fn recover_one(
        &self,
        intent: &PendingTransfer,
    ) -> Result<Option<PendingTransferStatus>, LedgerError> {
        let in_from = self.holds_marker(&intent.from, &intent.id).await?;
        let in_to = self.holds_marker(&intent.to, &intent.id).await?;

        match (in_from, in_to) {
            (true, true) => {
                self.commit(intent).await?;
                Ok(Some(PendingTransferStatus::Completed))
            }
            (true, false) => match self.credit(intent).await {
                Ok(()) => {
                    self.commit(intent).await?;
                    Ok(Some(PendingTransferStatus::Completed))
                }
                Err(LedgerError::RecipientNotFound { .. }) => {
                    Ok(Some(PendingTransferStatus::Failed))
                }
                Err(e) => Err(e),
            },
            (false, false) => {
                if self.mark_failed(&intent.id, "no balance change applied").await? {
                    Ok(Some(PendingTransferStatus::Failed))
                } else {
                    Ok(None)
                }
            }
            (false, true) => {
                // another pass committed and is releasing markers
                if self
                    .load(&intent.id)
                    .await?
                    .is_some_and(|i| i.status.is_terminal())
                {
                    return Ok(None);
                }
                error!(
                    transfer_id = %intent.id,
                    from = %intent.from,
                    to = %intent.to,
                    "CRITICAL: recipient credited without sender debit, leaving for operator"
                );
                Ok(None)
            }
        }
    }

    /// Credit leg; a missing recipient refunds the sender and fails the intent
    async fn credit(&self, intent: &PendingTransfer) -> Result<(), LedgerError> {
        let id = intent.id.as_str();
        let credited = self
            .store
            .update_one(
                USERS,
                &by_key(&intent.to).and(Filter::not_contains(account::fields::PENDING_TRANSFERS, id)),
                &Update::new()
                    .inc(account::fields::BALANCE, intent.amount)
                    .add_to_set(account::fields::PENDING_TRANSFERS, id),
                self.write_level(),
            )
            .await?;
        if credited.matched > 0 {
            return self.reclaim_if_committed(intent).await;
        }

        if self.account(&intent.to).await?.is_some() {
            debug!(transfer_id = id, "Credit already applied");
            return Ok(());
        }

        warn!(transfer_id = id, to = %intent.to, "Recipient missing, refunding sender");
        if let Err(e) = self.refund_sender(intent).await {
            error!(
                transfer_id = id,
                account = %intent.from,
                amount = %intent.amount,
                error = %e,
                "Compensation write failed, intent stays pending"
            );
            return Err(LedgerError::CompensationFailed {
                account: intent.from.clone(),
                amount: intent.amount,
            });
        }
        self.mark_failed(id, "recipient not found").await?;
        Err(LedgerError::RecipientNotFound {
            account: intent.to.clone(),
        })
    }

    /// A credit that lands after another pass committed and released the
    /// intent is a second credit; take it back.
    async fn reclaim_if_committed(&self, intent: &PendingTransfer) -> Result<(), LedgerError> {
        let committed = self
            .load(&intent.id)
            .await?
            .is_some_and(|i| i.status == PendingTransferStatus::Completed);
        if !committed {
            return Ok(());
        }

        let id = intent.id.as_str();
        self.store
            .update_one(
                USERS,
                &by_key(&intent.to).and(Filter::contains(account::fields::PENDING_TRANSFERS, id)),
                &Update::new()
                    .inc(account::fields::BALANCE, -intent.amount)
                    .pull(account::fields::PENDING_TRANSFERS, id),
                self.write_level(),
            )
            .await?;
        warn!(transfer_id = id, to = %intent.to, "Duplicate credit after commit reclaimed");
        Ok(())
    }

    /// Undo the deduct leg if it is still applied
    async fn refund_sender(&self, intent: &PendingTransfer) -> Result<bool, LedgerError> {
        let id = intent.id.as_str();
        let refunded = self
            .store
            .update_one(
                USERS,
                &by_key(&intent.from).and(Filter::contains(account::fields::PENDING_TRANSFERS, id)),
                &Update::new()
                    .inc(account::fields::BALANCE, intent.amount)
                    .pull(account::fields::PENDING_TRANSFERS, id),
                self.write_level(),
            )
            .await?;
        Ok(refunded.modified > 0)
    }

    /// Undo both legs of a failed intent, each only if still applied.
    /// True if either leg was undone.
    async fn unwind(&self, intent: &PendingTransfer) -> Result<bool, LedgerError> {
        let id = intent.id.as_str();
        let reclaimed = self
            .store
            .update_one(
                USERS,
                &by_key(&intent.to).and(Filter::contains(account::fields::PENDING_TRANSFERS, id)),
                &Update::new()
                    .inc(account::fields::BALANCE, -intent.amount)
                    .pull(account::fields::PENDING_TRANSFERS, id),
                self.write_level(),
            )
            .await?;
        let reclaimed = reclaimed.modified > 0;
        let refunded = self.refund_sender(intent).await?;
        if reclaimed || refunded {
            info!(transfer_id = id, reclaimed, refunded, "Failed transfer unwound");
        }
        Ok(reclaimed || refunded)
    }

    /// Pull the marker from `from` before `to`; true if either account
    /// still held it
    ///
    /// A partial cleanup then never looks like "only `from` holds it",
    /// which recovery would read as a missing credit.
    async fn release(&self, intent: &PendingTransfer) -> Result<bool, LedgerError> {
        let mut pulled = false;
        for key in [&intent.from, &intent.to] {
            let result = self
                .store
                .update_one(
                    USERS,
                    &by_key(key),
                    &Update::new().pull(account::fields::PENDING_TRANSFERS, intent.id.as_str()),
                    self.write_level(),
                )
                .await?;
            pulled |= result.modified > 0;
        }
        Ok(pulled)
    }

    /// Best effort; an unflagged intent is only revisited by recovery
    async fn mark_released(&self, id: &str) {
        let result = self
            .store
            .update_one(
                PENDING_TRANSFERS,
                &Filter::id(id),
                &Update::new().set(fields::MARKERS_RELEASED, true),
                self.write_level(),
            )
            .await;
        if let Err(e) = result {
            warn!(transfer_id = id, error = %e, "Could not flag markers released");
        }
    }

    /// `pending → failed`; false if the intent was no longer pending
    async fn mark_failed(&self, id: &str, reason: &str) -> Result<bool, LedgerError> {
        let result = self
            .store
            .update_one(
                PENDING_TRANSFERS,
                &pending_intent(id),
                &Update::new()
                    .set(fields::STATUS, PendingTransferStatus::Failed.as_str())
                    .set(fields::FAILED_AT, Utc::now())
                    .set(fields::ERROR, reason),
                self.write_level(),
            )
            .await?;
        if result.modified > 0 {
            warn!(transfer_id = id, reason, "Transfer intent failed");
        }
        Ok(result.modified > 0)
    }

    /// Current intent record (strongly consistent)
    pub async fn load(&self, id: &str) -> Result<Option<PendingTransfer>, LedgerError> {
        let doc = self
            .store
            .find_one(
                PENDING_TRANSFERS,
                &Filter::id(id),
                self.policy.read_level(ReadClass::Financial),
            )
            .await?;
        doc.as_ref().map(PendingTransfer::from_document).transpose()
    }

    async fn account(&self, public_key: &str) -> Result<Option<Account>, LedgerError> {
        let doc = self
            .store
            .find_one(
                USERS,
                &by_key(public_key),
                self.policy.read_level(ReadClass::Financial),
            )
            .await?;
        doc.as_ref().map(Account::from_document).transpose()
    }

    async fn holds_marker(&self, public_key: &str, id: &str) -> Result<bool, LedgerError> {
        Ok(self
            .account(public_key)
            .await?
            .is_some_and(|a| a.has_in_flight(id)))
    }

    fn write_level(&self) -> WriteLevel {
        self.policy.write_level(WriteClass::Financial)
    }
}

fn pending_intent(id: &str) -> Filter {
    Filter::id(id).and(Filter::eq(
        fields::STATUS,
        PendingTransferStatus::Pending.as_str(),
    ))
}

/// `now - older_than`, rejecting ages that do not fit a timestamp
pub(crate) fn cutoff(older_than: Duration) -> Result<DateTime<Utc>, LedgerError> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| {
            LedgerError::Config(format!("staleness threshold out of range: {older_than:?}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ReadLevel;
    use crate::store::{ChangeStream, Document, EventFilter, MemoryStore, ResumeCursor, UpdateResult};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn setup(accounts: &[(&str, Decimal)]) -> (Arc<MemoryStore>, TwoPhaseCommitCoordinator) {
        let store = Arc::new(MemoryStore::with_ledger_indexes());
        for (key, balance) in accounts {
            store
                .insert(USERS, Account::new_document(key, *balance), WriteLevel::FINANCIAL)
                .await
                .unwrap();
        }
        let coordinator = TwoPhaseCommitCoordinator::new(store.clone(), StoragePolicy::default());
        (store, coordinator)
    }

    fn account_of(store: &MemoryStore, key: &str) -> Account {
        Account::from_document(&store.document(USERS, key).unwrap()).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn test_happy_path_completes_and_cleans_up() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;

        let result = coordinator.transfer("0xa", "0xb", dec!(6)).await.unwrap();
        let intent = coordinator.load(&result.tx_hash).await.unwrap().unwrap();
        assert_eq!(intent.status, PendingTransferStatus::Completed);
        assert!(intent.completed_at.is_some());
        assert!(intent.markers_released);

        let a = account_of(&store, "0xa");
        let b = account_of(&store, "0xb");
        assert_eq!(a.balance, dec!(4));
        assert_eq!(b.balance, dec!(6));
        assert!(a.pending_transfers.is_empty());
        assert!(b.pending_transfers.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_intent_without_mutation() {
        let (store, coordinator) = setup(&[("0xa", dec!(1)), ("0xb", dec!(0))]).await;

        let intent = coordinator.prepare("0xa", "0xb", dec!(5)).await.unwrap();
        let err = coordinator.execute(&intent).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalanceOrNotFound { .. }));

        let stored = coordinator.load(&intent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PendingTransferStatus::Failed);
        assert_eq!(account_of(&store, "0xa").balance, dec!(1));
    }

    #[tokio::test]
    async fn test_missing_recipient_is_compensated() {
        let (store, coordinator) = setup(&[("0xa", dec!(10))]).await;

        let err = coordinator.transfer("0xa", "0xghost", dec!(3)).await.unwrap_err();
        assert!(matches!(err, LedgerError::RecipientNotFound { .. }));

        let a = account_of(&store, "0xa");
        assert_eq!(a.balance, dec!(10));
        assert!(a.pending_transfers.is_empty());

        let intents = store.documents(PENDING_TRANSFERS);
        let intent = PendingTransfer::from_document(&intents[0]).unwrap();
        assert_eq!(intent.status, PendingTransferStatus::Failed);
        assert_eq!(intent.error.as_deref(), Some("recipient not found"));
    }

    #[tokio::test]
    async fn test_prepare_failure_has_no_side_effects() {
        let store = Arc::new(MemoryStore::new());
        store.add_unique_index(PENDING_TRANSFERS, "from");
        store
            .insert(USERS, Account::new_document("0xa", dec!(10)), WriteLevel::FINANCIAL)
            .await
            .unwrap();
        let coordinator = TwoPhaseCommitCoordinator::new(store.clone(), StoragePolicy::default());
        coordinator.prepare("0xa", "0xb", dec!(1)).await.unwrap();

        assert!(coordinator.prepare("0xa", "0xb", dec!(1)).await.is_err());
        assert_eq!(store.documents(PENDING_TRANSFERS).len(), 1);
        assert_eq!(account_of(&store, "0xa").balance, dec!(10));
    }

    #[tokio::test]
    async fn test_execute_is_idempotent() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;

        let intent = coordinator.prepare("0xa", "0xb", dec!(4)).await.unwrap();
        coordinator.execute(&intent).await.unwrap();
        coordinator.execute(&intent).await.unwrap();
        coordinator.commit(&intent).await.unwrap();
        coordinator.commit(&intent).await.unwrap();

        assert_eq!(account_of(&store, "0xa").balance, dec!(6));
        assert_eq!(account_of(&store, "0xb").balance, dec!(4));
    }

    #[tokio::test]
    async fn test_execute_after_commit_is_rejected() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        let intent = coordinator.prepare("0xa", "0xb", dec!(4)).await.unwrap();
        coordinator.execute(&intent).await.unwrap();
        coordinator.commit(&intent).await.unwrap();

        let err = coordinator.execute(&intent).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyFinalized { .. }));
        assert_eq!(account_of(&store, "0xa").balance, dec!(6));
        assert_eq!(account_of(&store, "0xb").balance, dec!(4));
    }

    #[tokio::test]
    async fn test_late_credit_after_commit_is_reclaimed() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        let intent = coordinator.prepare("0xa", "0xb", dec!(4)).await.unwrap();
        coordinator.execute(&intent).await.unwrap();
        coordinator.commit(&intent).await.unwrap();

        // A recovery pass that read the markers before the commit
        coordinator.credit(&intent).await.unwrap();

        let b = account_of(&store, "0xb");
        assert_eq!(b.balance, dec!(4));
        assert!(b.pending_transfers.is_empty());
    }

    #[tokio::test]
    async fn test_storage_error_in_execute_leaves_pending() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        // deduct applies, credit fails
        store.fail_updates(USERS, 1, 1);

        let err = coordinator.transfer("0xa", "0xb", dec!(2)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));

        let intents = store.documents(PENDING_TRANSFERS);
        let intent = PendingTransfer::from_document(&intents[0]).unwrap();
        assert_eq!(intent.status, PendingTransferStatus::Pending);
        assert!(account_of(&store, "0xa").has_in_flight(&intent.id));
        assert!(!account_of(&store, "0xb").has_in_flight(&intent.id));
    }

    #[tokio::test]
    async fn test_recover_finishes_missing_credit() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        store.fail_updates(USERS, 1, 1);
        let _ = coordinator.transfer("0xa", "0xb", dec!(2)).await;
        settle().await;

        let report = coordinator.recover(Duration::ZERO, 100).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(account_of(&store, "0xa").balance, dec!(8));
        assert_eq!(account_of(&store, "0xb").balance, dec!(2));
        assert!(account_of(&store, "0xa").pending_transfers.is_empty());
        assert!(account_of(&store, "0xb").pending_transfers.is_empty());
    }

    #[tokio::test]
    async fn test_recover_commits_fully_executed_intent() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        let intent = coordinator.prepare("0xa", "0xb", dec!(3)).await.unwrap();
        coordinator.execute(&intent).await.unwrap();
        settle().await;

        let report = coordinator.recover(Duration::ZERO, 100).await.unwrap();
        assert_eq!(
            report,
            RecoveryReport { scanned: 1, completed: 1, failed: 0, skipped: 0, released: 0 }
        );
        let stored = coordinator.load(&intent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PendingTransferStatus::Completed);
        assert_eq!(account_of(&store, "0xb").balance, dec!(3));
    }

    #[tokio::test]
    async fn test_recover_fails_untouched_intent() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        let intent = coordinator.prepare("0xa", "0xb", dec!(3)).await.unwrap();
        settle().await;

        let report = coordinator.recover(Duration::ZERO, 100).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            coordinator.load(&intent.id).await.unwrap().unwrap().status,
            PendingTransferStatus::Failed
        );
        assert_eq!(account_of(&store, "0xa").balance, dec!(10));

        let err = coordinator.execute(&intent).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyFinalized { .. }));
        assert_eq!(account_of(&store, "0xa").balance, dec!(10));
        assert!(account_of(&store, "0xa").pending_transfers.is_empty());
    }

    #[tokio::test]
    async fn test_commit_after_concurrent_failure_unwinds() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        let intent = coordinator.prepare("0xa", "0xb", dec!(3)).await.unwrap();
        coordinator.execute(&intent).await.unwrap();

        // Failed by another process between execute and commit
        store
            .update_one(
                PENDING_TRANSFERS,
                &Filter::id(&intent.id),
                &Update::new()
                    .set(fields::STATUS, PendingTransferStatus::Failed.as_str())
                    .set(fields::FAILED_AT, Utc::now()),
                WriteLevel::FINANCIAL,
            )
            .await
            .unwrap();

        let err = coordinator.commit(&intent).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyFinalized { .. }));
        let a = account_of(&store, "0xa");
        let b = account_of(&store, "0xb");
        assert_eq!(a.balance, dec!(10));
        assert_eq!(b.balance, dec!(0));
        assert!(a.pending_transfers.is_empty());
        assert!(b.pending_transfers.is_empty());
        assert!(coordinator.load(&intent.id).await.unwrap().unwrap().markers_released);
    }

    #[tokio::test]
    async fn test_release_failure_after_completion_is_deferred() {
        let (store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        // deduct and credit apply, first marker pull fails
        store.fail_updates(USERS, 2, 1);

        let result = coordinator.transfer("0xa", "0xb", dec!(4)).await.unwrap();
        let intent = coordinator.load(&result.tx_hash).await.unwrap().unwrap();
        assert_eq!(intent.status, PendingTransferStatus::Completed);
        assert!(!intent.markers_released);
        assert!(account_of(&store, "0xa").has_in_flight(&intent.id));
        assert!(account_of(&store, "0xb").has_in_flight(&intent.id));
        settle().await;

        let report = coordinator.recover(Duration::ZERO, 100).await.unwrap();
        assert_eq!(report, RecoveryReport { released: 1, ..Default::default() });
        let a = account_of(&store, "0xa");
        let b = account_of(&store, "0xb");
        assert_eq!(a.balance, dec!(6));
        assert_eq!(b.balance, dec!(4));
        assert!(a.pending_transfers.is_empty());
        assert!(b.pending_transfers.is_empty());
        assert!(coordinator.load(&intent.id).await.unwrap().unwrap().markers_released);

        let again = coordinator.recover(Duration::ZERO, 100).await.unwrap();
        assert_eq!(again, RecoveryReport::default());
    }

    /// Runs a recovery pass on the backing store right before the first
    /// balance write, then optionally starts failing intent reads
    struct RecoveryRacingStore {
        inner: Arc<MemoryStore>,
        armed: AtomicBool,
        lose_intent_reads: bool,
        intent_reads_down: AtomicBool,
    }

    impl RecoveryRacingStore {
        fn new(inner: Arc<MemoryStore>, lose_intent_reads: bool) -> Self {
            Self {
                inner,
                armed: AtomicBool::new(false),
                lose_intent_reads,
                intent_reads_down: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for RecoveryRacingStore {
        async fn update_one(
            &self,
            collection: &str,
            filter: &Filter,
            update: &Update,
            level: WriteLevel,
        ) -> Result<UpdateResult, StoreError> {
            if collection == USERS && self.armed.swap(false, Ordering::SeqCst) {
                settle().await;
                let recovery =
                    TwoPhaseCommitCoordinator::new(self.inner.clone(), StoragePolicy::default());
                let report = recovery
                    .recover(Duration::ZERO, 100)
                    .await
                    .map_err(|e| StoreError::Internal(e.to_string()))?;
                assert_eq!(report.failed, 1);
                self.intent_reads_down.store(self.lose_intent_reads, Ordering::SeqCst);
            }
            self.inner.update_one(collection, filter, update, level).await
        }

        async fn update_many(
            &self,
            collection: &str,
            filter: &Filter,
            update: &Update,
            level: WriteLevel,
        ) -> Result<UpdateResult, StoreError> {
            self.inner.update_many(collection, filter, update, level).await
        }

        async fn insert(
            &self,
            collection: &str,
            document: Document,
            level: WriteLevel,
        ) -> Result<String, StoreError> {
            self.inner.insert(collection, document, level).await
        }

        async fn find_one(
            &self,
            collection: &str,
            filter: &Filter,
            level: ReadLevel,
        ) -> Result<Option<Document>, StoreError> {
            if collection == PENDING_TRANSFERS && self.intent_reads_down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("intent read lost".into()));
            }
            self.inner.find_one(collection, filter, level).await
        }

        async fn find(
            &self,
            collection: &str,
            filter: &Filter,
            level: ReadLevel,
        ) -> Result<Vec<Document>, StoreError> {
            self.inner.find(collection, filter, level).await
        }

        async fn watch(
            &self,
            collection: &str,
            filter: &EventFilter,
            resume_from: Option<ResumeCursor>,
        ) -> Result<ChangeStream, StoreError> {
            self.inner.watch(collection, filter, resume_from).await
        }
    }

    #[tokio::test]
    async fn test_execute_undoes_legs_when_recovery_fails_intent_midway() {
        let (store, _) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        let racing = Arc::new(RecoveryRacingStore::new(store.clone(), false));
        let coordinator = TwoPhaseCommitCoordinator::new(racing.clone(), StoragePolicy::default());

        let intent = coordinator.prepare("0xa", "0xb", dec!(4)).await.unwrap();
        racing.armed.store(true, Ordering::SeqCst);

        let err = coordinator.execute(&intent).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyFinalized { .. }));

        let a = account_of(&store, "0xa");
        let b = account_of(&store, "0xb");
        assert_eq!(a.balance, dec!(10));
        assert_eq!(b.balance, dec!(0));
        assert!(a.pending_transfers.is_empty());
        assert!(b.pending_transfers.is_empty());
        let stored = coordinator.load(&intent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PendingTransferStatus::Failed);
        assert!(stored.markers_released);
    }

    #[tokio::test]
    async fn test_recovery_unwinds_legs_landed_after_failure() {
        let (store, recovery) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        let racing = Arc::new(RecoveryRacingStore::new(store.clone(), true));
        let coordinator = TwoPhaseCommitCoordinator::new(racing.clone(), StoragePolicy::default());

        let intent = coordinator.prepare("0xa", "0xb", dec!(4)).await.unwrap();
        racing.armed.store(true, Ordering::SeqCst);

        // Both legs land on a failed intent, then the executor loses the store
        let err = coordinator.execute(&intent).await.unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
        assert_eq!(account_of(&store, "0xa").balance, dec!(6));
        assert_eq!(account_of(&store, "0xb").balance, dec!(4));
        racing.intent_reads_down.store(false, Ordering::SeqCst);
        settle().await;

        let report = recovery.recover(Duration::ZERO, 100).await.unwrap();
        assert_eq!(report, RecoveryReport { released: 1, ..Default::default() });
        let a = account_of(&store, "0xa");
        let b = account_of(&store, "0xb");
        assert_eq!(a.balance, dec!(10));
        assert_eq!(b.balance, dec!(0));
        assert!(a.pending_transfers.is_empty());
        assert!(b.pending_transfers.is_empty());

        let again = recovery.recover(Duration::ZERO, 100).await.unwrap();
        assert_eq!(again, RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_recover_respects_staleness_threshold() {
        let (_store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        coordinator.prepare("0xa", "0xb", dec!(3)).await.unwrap();

        let report = coordinator.recover(Duration::from_secs(3600), 100).await.unwrap();
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_recover_batch_size() {
        let (_store, coordinator) = setup(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        for _ in 0..3 {
            coordinator.prepare("0xa", "0xb", dec!(1)).await.unwrap();
        }
        settle().await;

        assert_eq!(coordinator.recover(Duration::ZERO, 2).await.unwrap().scanned, 2);
        assert_eq!(coordinator.recover(Duration::ZERO, 2).await.unwrap().scanned, 1);
    }

    #[test]
    fn test_cutoff_rejects_overflow() {
        assert!(cutoff(Duration::from_secs(60)).is_ok());
        assert!(matches!(cutoff(Duration::MAX), Err(LedgerError::Config(_))));
    }
}
