//! Transaction Change Watcher
//!
//! Resumable subscriptions on the transaction change feed with
//! at-least-once dispatch to [`TransactionHandler`]s.

pub mod backoff;
pub mod cursor;
pub mod event;
pub mod handler;
pub mod subscription;

pub use backoff::Backoff;
pub use cursor::{CursorStore, MemoryCursorStore, PgCursorStore};
pub use event::{TransactionEvent, classify};
pub use handler::{TransactionHandler, dispatch};
pub use subscription::{ChangeWatcher, SubscriptionHandle, WatcherStatus};
