//! Transfer Coordinator
//!
//! Moves value between two accounts with single-document conditional
//! updates and a synchronous compensating credit.
//!
//! ```text
//! deduct(from, balance >= amount) ──0 matched──▶ InsufficientBalanceOrNotFound
//!        │
//!        ▼
//! credit(to) ──0 matched / error──▶ refund(from) ──▶ RecipientNotFound
//!        │                                │
//!        ▼                                └─fails─▶ CompensationFailed
//! record transaction (confirmed)
//! ```
//!
//! No in-process lock guards balances. Concurrent transfers on the same
//! account race on the conditional deduct and the store picks one winner.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::account::{by_key, fields};
use super::types::TransferResult;
use crate::error::LedgerError;
use crate::policy::{StoragePolicy, WriteClass};
use crate::store::{DocumentStore, Filter, USERS, Update};
use crate::transaction::{
    Transaction, TransactionKind, TransactionStateMachine, TransactionStatus,
};

/// Single-step transfer with compensation
pub struct TransferCoordinator {
    store: Arc<dyn DocumentStore>,
    policy: StoragePolicy,
    transactions: TransactionStateMachine,
}

impl TransferCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, policy: StoragePolicy) -> Self {
        Self {
            transactions: TransactionStateMachine::new(store.clone(), policy),
            store,
            policy,
        }
    }

    /// Transfer `amount` from `from` to `to`
    ///
    /// On any error other than `CompensationFailed` and `UnrecordedTransfer`
    /// both balances are exactly as they were before the call.
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<TransferResult, LedgerError> {
        validate(from, to, amount)?;
        debug!(from, to, amount = %amount, "Starting transfer");

        // 1. Deduct, failing closed
        let write = self.policy.write_level(WriteClass::Financial);
        let deducted = self
            .store
            .update_one(
                USERS,
                &by_key(from).and(Filter::gte(fields::BALANCE, amount)),
                &Update::new().inc(fields::BALANCE, -amount),
                write,
            )
            .await?;
        if deducted.modified == 0 {
            debug!(from, amount = %amount, "Deduct precondition failed");
            return Err(LedgerError::InsufficientBalanceOrNotFound {
                account: from.to_string(),
            });
        }

        // 2. Credit; compensate on a missing recipient or a failed write
        let credited = self
            .store
            .update_one(
                USERS,
                &by_key(to),
                &Update::new().inc(fields::BALANCE, amount),
                write,
            )
            .await;
        match credited {
            Ok(r) if r.matched > 0 => {}
            Ok(_) => {
                self.compensate(from, amount).await?;
                return Err(LedgerError::RecipientNotFound {
                    account: to.to_string(),
                });
            }
            Err(e) => {
                warn!(from, to, error = %e, "Credit failed, refunding sender");
                self.compensate(from, amount).await?;
                return Err(e.into());
            }
        }

        // 3. Record
        let tx = Transaction::new(
            from,
            to,
            amount,
            TransactionKind::Send,
            TransactionStatus::Confirmed,
        );
        if let Err(e) = self.transactions.record(&tx).await {
            error!(
                tx_hash = %tx.tx_hash,
                from,
                to,
                amount = %amount,
                error = %e,
                "Balances moved but transaction record failed"
            );
            return Err(LedgerError::UnrecordedTransfer { tx_hash: tx.tx_hash });
        }

        info!(tx_hash = %tx.tx_hash, from, to, amount = %amount, "Transfer completed");
        Ok(TransferResult {
            tx_hash: tx.tx_hash,
            from: from.to_string(),
            to: to.to_string(),
            amount,
            confirmed_at: tx.confirmed_at.unwrap_or(tx.created_at),
        })
    }

    /// Undo step 1; unconditional so it applies whenever the sender exists
    async fn compensate(&self, from: &str, amount: Decimal) -> Result<(), LedgerError> {
        let refunded = self
            .store
            .update_one(
                USERS,
                &by_key(from),
                &Update::new().inc(fields::BALANCE, amount),
                self.policy.write_level(WriteClass::Financial),
            )
            .await;

        match refunded {
            Ok(r) if r.modified > 0 => {
                info!(account = from, amount = %amount, "Deduct compensated");
                Ok(())
            }
            Ok(_) => {
                error!(account = from, amount = %amount, "Compensation matched no account");
                Err(LedgerError::CompensationFailed {
                    account: from.to_string(),
                    amount,
                })
            }
            Err(e) => {
                error!(account = from, amount = %amount, error = %e, "Compensation write failed");
                Err(LedgerError::CompensationFailed {
                    account: from.to_string(),
                    amount,
                })
            }
        }
    }
}

/// Shared preconditions of both transfer protocols
pub(crate) fn validate(from: &str, to: &str, amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount);
    }
    if from == to {
        return Err(LedgerError::SameAccount);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::WriteLevel;
    use crate::store::{MemoryStore, TRANSACTIONS};
    use crate::transfer::account::{Account, AccountReader};
    use rust_decimal_macros::dec;

    struct TestHarness {
        store: Arc<MemoryStore>,
        coordinator: TransferCoordinator,
        reader: AccountReader,
    }

    impl TestHarness {
        async fn new(accounts: &[(&str, Decimal)]) -> Self {
            let store = Arc::new(MemoryStore::with_ledger_indexes());
            for (key, balance) in accounts {
                store
                    .insert(USERS, Account::new_document(key, *balance), WriteLevel::FINANCIAL)
                    .await
                    .unwrap();
            }
            Self {
                coordinator: TransferCoordinator::new(store.clone(), StoragePolicy::default()),
                reader: AccountReader::new(store.clone(), StoragePolicy::default()),
                store,
            }
        }

        async fn balance(&self, key: &str) -> Decimal {
            self.reader.balance(key).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_transfer_moves_and_records() {
        let h = TestHarness::new(&[("0xa", dec!(10.0)), ("0xb", dec!(0.0))]).await;

        let result = h.coordinator.transfer("0xa", "0xb", dec!(6.0)).await.unwrap();
        assert_eq!(h.balance("0xa").await, dec!(4.0));
        assert_eq!(h.balance("0xb").await, dec!(6.0));
        assert_eq!(result.amount, dec!(6.0));

        let txs = h.store.documents(TRANSACTIONS);
        assert_eq!(txs.len(), 1);
        let tx = Transaction::from_document(&txs[0]).unwrap();
        assert_eq!(tx.tx_hash, result.tx_hash);
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert!(tx.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn test_validation() {
        let h = TestHarness::new(&[("0xa", dec!(10))]).await;
        assert!(matches!(
            h.coordinator.transfer("0xa", "0xb", dec!(0)).await,
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            h.coordinator.transfer("0xa", "0xb", dec!(-1)).await,
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            h.coordinator.transfer("0xa", "0xa", dec!(1)).await,
            Err(LedgerError::SameAccount)
        ));
        assert_eq!(h.store.oplog_len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sender_fails_closed() {
        let h = TestHarness::new(&[("0xb", dec!(0))]).await;
        let err = h.coordinator.transfer("0xnobody", "0xb", dec!(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalanceOrNotFound { .. }));
        assert_eq!(h.balance("0xb").await, dec!(0));
    }

    #[tokio::test]
    async fn test_failed_credit_write_is_compensated() {
        let h = TestHarness::new(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        // deduct passes, credit fails
        h.store.fail_updates(USERS, 1, 1);

        let err = h.coordinator.transfer("0xa", "0xb", dec!(3)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
        assert_eq!(h.balance("0xa").await, dec!(10));
        assert_eq!(h.balance("0xb").await, dec!(0));
        assert!(h.store.documents(TRANSACTIONS).is_empty());
    }

    #[tokio::test]
    async fn test_failed_compensation_is_reported() {
        let h = TestHarness::new(&[("0xa", dec!(10))]).await;
        // deduct passes, credit matches nothing, refund fails
        h.store.fail_updates(USERS, 2, 1);

        let err = h.coordinator.transfer("0xa", "0xghost", dec!(3)).await.unwrap_err();
        match err {
            LedgerError::CompensationFailed { account, amount } => {
                assert_eq!(account, "0xa");
                assert_eq!(amount, dec!(3));
            }
            other => panic!("expected CompensationFailed, got {other:?}"),
        }
        assert!(LedgerError::CompensationFailed {
            account: "0xa".into(),
            amount: dec!(3)
        }
        .needs_operator());
    }

    #[tokio::test]
    async fn test_unrecorded_transfer_reported() {
        let h = TestHarness::new(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        h.store.add_unique_index(TRANSACTIONS, "from");
        h.coordinator.transfer("0xa", "0xb", dec!(1)).await.unwrap();

        // second record collides on the extra unique index
        let err = h.coordinator.transfer("0xa", "0xb", dec!(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnrecordedTransfer { .. }));
        assert_eq!(h.balance("0xa").await, dec!(8));
        assert_eq!(h.balance("0xb").await, dec!(2));
    }

    #[tokio::test]
    async fn test_money_movement_uses_financial_level() {
        let h = TestHarness::new(&[("0xa", dec!(10)), ("0xb", dec!(0))]).await;
        h.coordinator.transfer("0xa", "0xb", dec!(1)).await.unwrap();
        let _ = h.coordinator.transfer("0xa", "0xmissing", dec!(1)).await;

        let levels = h.store.write_levels(USERS);
        // 2 seeds + 2 updates + 3 updates
        assert_eq!(levels.len(), 7);
        assert!(levels.iter().all(|l| l.is_financial_grade()));
        assert!(h
            .store
            .write_levels(TRANSACTIONS)
            .iter()
            .all(|l| l.is_financial_grade()));
    }
}
