//! Storage Port
//!
//! The document store the ledger runs on. It only has to offer
//! per-document atomicity:
//!
//! - conditional single-document update (filter re-checked at write time)
//! - insert / find
//! - an ordered change feed per collection with resumable positions
//!
//! # Write contract
//!
//! An `Err` from `update_one`, `update_many` or `insert` means the mutation
//! was NOT applied. Backends that cannot tell (e.g. a write concern timeout)
//! must surface that as `Ok` after re-reading, never as `Err`.

pub mod document;
pub mod memory;

pub use document::{Document, Filter, ID_FIELD, Update, UpdateOp, Value};
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use thiserror::Error;

use crate::policy::{ReadLevel, WriteLevel};

/// Collection holding user documents with their embedded account
pub const USERS: &str = "users";
/// Collection holding transaction records
pub const TRANSACTIONS: &str = "transactions";
/// Collection holding two-phase transfer intents
pub const PENDING_TRANSFERS: &str = "pending_transfers";
/// Collection holding activity log entries
pub const ACTIVITY_LOGS: &str = "activity_logs";

/// Storage backend errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("duplicate key {key} in {collection}")]
    DuplicateKey { collection: String, key: String },

    #[error("invalid resume cursor: {0}")]
    InvalidCursor(String),

    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Outcome of a conditional update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateResult {
    /// Documents matching the filter at write time
    pub matched: u64,
    /// Documents whose content changed
    pub modified: u64,
}

/// Opaque position in a collection's change feed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResumeCursor(String);

impl ResumeCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of mutation reported by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change-feed entry
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: OperationType,
    pub document_key: String,
    /// Post-image of the document; absent for deletes
    pub full_document: Option<Document>,
    pub position: ResumeCursor,
}

/// Server-side selection applied to a change feed
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    /// Empty means every operation type
    pub operations: Vec<OperationType>,
    /// Applied to the post-image
    pub document: Filter,
}

impl EventFilter {
    pub fn all() -> Self {
        Self {
            operations: Vec::new(),
            document: Filter::All,
        }
    }

    /// Inserts and updates only
    pub fn inserts_and_updates() -> Self {
        Self {
            operations: vec![OperationType::Insert, OperationType::Update],
            document: Filter::All,
        }
    }

    pub fn with_document(mut self, filter: Filter) -> Self {
        self.document = self.document.and(filter);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&event.operation) {
            return false;
        }
        match (&self.document, &event.full_document) {
            (Filter::All, _) => true,
            (filter, Some(doc)) => filter.matches(doc),
            (_, None) => false,
        }
    }
}

/// Ordered change stream; ends or yields `Err` when the subscription is lost
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

/// Document store consumed by the coordinators and the watcher
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply `update` to the first document matching `filter`, atomically
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        level: WriteLevel,
    ) -> Result<UpdateResult, StoreError>;

    /// Apply `update` to every matching document; each document is atomic on its own
    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        level: WriteLevel,
    ) -> Result<UpdateResult, StoreError>;

    /// Insert a document, returning its `_id`
    async fn insert(
        &self,
        collection: &str,
        document: Document,
        level: WriteLevel,
    ) -> Result<String, StoreError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        level: ReadLevel,
    ) -> Result<Option<Document>, StoreError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        level: ReadLevel,
    ) -> Result<Vec<Document>, StoreError>;

    /// Open a change stream, resuming strictly after `resume_from` when given
    async fn watch(
        &self,
        collection: &str,
        filter: &EventFilter,
        resume_from: Option<ResumeCursor>,
    ) -> Result<ChangeStream, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(op: OperationType, status: &str) -> ChangeEvent {
        ChangeEvent {
            operation: op,
            document_key: "tx1".into(),
            full_document: Some(Document::new().with("status", status).with("from", "0xa")),
            position: ResumeCursor::new("1"),
        }
    }

    #[test]
    fn test_event_filter_operations() {
        let filter = EventFilter::inserts_and_updates();
        assert!(filter.matches(&event(OperationType::Insert, "pending")));
        assert!(filter.matches(&event(OperationType::Update, "confirmed")));
        assert!(!filter.matches(&event(OperationType::Delete, "pending")));
        assert!(EventFilter::all().matches(&event(OperationType::Delete, "pending")));
    }

    #[test]
    fn test_event_filter_document() {
        let filter = EventFilter::inserts_and_updates().with_document(Filter::eq("from", "0xb"));
        assert!(!filter.matches(&event(OperationType::Insert, "pending")));

        let mut deleted = event(OperationType::Update, "pending");
        deleted.full_document = None;
        let filter = EventFilter::all().with_document(Filter::eq("from", "0xa"));
        assert!(!filter.matches(&deleted));
    }
}
