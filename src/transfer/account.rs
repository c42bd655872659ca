//! Account Access
//!
//! The account is embedded in the user document: `publicKey`, `balance` and
//! the `pendingTransfers` in-flight set used by the two-phase path.
//! Balances only move through conditional `$inc`s issued by the coordinators.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::trace;

use crate::error::LedgerError;
use crate::policy::{ReadClass, StoragePolicy, WriteClass};
use crate::store::{
    ACTIVITY_LOGS, Document, DocumentStore, Filter, ID_FIELD, TRANSACTIONS, USERS, Value,
};
use crate::transaction;

/// Stored field names
pub mod fields {
    pub const PUBLIC_KEY: &str = "publicKey";
    pub const BALANCE: &str = "balance";
    pub const PENDING_TRANSFERS: &str = "pendingTransfers";
    pub const CREATED_AT: &str = "createdAt";
}

/// Account view of a user document
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub public_key: String,
    pub balance: Decimal,
    /// Two-phase transfer ids currently touching this account
    pub pending_transfers: Vec<String>,
}

impl Account {
    /// Fresh user document for `public_key` with the given opening balance
    pub fn new_document(public_key: &str, balance: Decimal) -> Document {
        Document::new()
            .with(ID_FIELD, public_key)
            .with(fields::PUBLIC_KEY, public_key)
            .with(fields::BALANCE, balance)
            .with(fields::PENDING_TRANSFERS, Value::Array(Vec::new()))
            .with(fields::CREATED_AT, Utc::now())
    }

    pub fn from_document(doc: &Document) -> Result<Self, LedgerError> {
        let public_key = doc
            .get_str(fields::PUBLIC_KEY)
            .ok_or_else(|| LedgerError::MalformedDocument("user without publicKey".into()))?;
        let balance = match doc.get(fields::BALANCE) {
            None | Some(Value::Null) => Decimal::ZERO,
            Some(v) => v.as_decimal().ok_or_else(|| {
                LedgerError::MalformedDocument(format!("{public_key}: balance is not a decimal"))
            })?,
        };
        let pending_transfers = doc
            .get(fields::PENDING_TRANSFERS)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            public_key: public_key.to_string(),
            balance,
            pending_transfers,
        })
    }

    pub fn has_in_flight(&self, transfer_id: &str) -> bool {
        self.pending_transfers.iter().any(|id| id == transfer_id)
    }
}

/// Filter selecting one account by public key
pub fn by_key(public_key: &str) -> Filter {
    Filter::eq(fields::PUBLIC_KEY, public_key)
}

/// Read side of accounts, each read at the freshness its use needs
pub struct AccountReader {
    store: Arc<dyn DocumentStore>,
    policy: StoragePolicy,
}

impl AccountReader {
    pub fn new(store: Arc<dyn DocumentStore>, policy: StoragePolicy) -> Self {
        Self { store, policy }
    }

    /// Strongly consistent account read
    pub async fn account(&self, public_key: &str) -> Result<Option<Account>, LedgerError> {
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

    /// Strongly consistent balance; a missing account reads as zero
    pub async fn balance(&self, public_key: &str) -> Result<Decimal, LedgerError> {
        Ok(self
            .account(public_key)
            .await?
            .map(|a| a.balance)
            .unwrap_or(Decimal::ZERO))
    }

    /// Number of transactions sent by `public_key`, stale-tolerant
    pub async fn count_transactions_from(&self, public_key: &str) -> Result<usize, LedgerError> {
        let docs = self
            .store
            .find(
                TRANSACTIONS,
                &Filter::eq(transaction::fields::FROM, public_key),
                self.policy.read_level(ReadClass::Analytics),
            )
            .await?;
        Ok(docs.len())
    }
}

/// Fire-and-forget user activity log
pub struct ActivityLog {
    store: Arc<dyn DocumentStore>,
    policy: StoragePolicy,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn DocumentStore>, policy: StoragePolicy) -> Self {
        Self { store, policy }
    }

    /// Record an action; failures are logged and dropped
    pub async fn record(&self, user: &str, action: &str) {
        let entry = Document::new()
            .with("userId", user)
            .with("action", action)
            .with("timestamp", Utc::now());
        if let Err(e) = self
            .store
            .insert(
                ACTIVITY_LOGS,
                entry,
                self.policy.write_level(WriteClass::FireAndForget),
            )
            .await
        {
            trace!(user, action, error = %e, "Activity log write dropped");
        }
    }
}
