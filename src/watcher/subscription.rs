//! Change Watcher
//!
//! One background task per subscription pulls the transaction change feed
//! in order, dispatches each event, then persists its position.
//!
//! ```text
//! ┌───────────────┐ events ┌──────────────┐ dispatch ┌─────────┐
//! │ DocumentStore ├───────▶│ Subscription ├─────────▶│ Handler │
//! └───────────────┘        └──────┬───────┘          └─────────┘
//!                                 │ save position
//!                                 ▼
//!                          ┌─────────────┐
//!                          │ CursorStore │
//!                          └─────────────┘
//! ```
//!
//! Delivery is at-least-once. A crash between dispatch and the cursor save
//! redelivers that event; events before the saved cursor never come back.
//! A lost stream, a failed handler or a failed cursor save all resubscribe
//! from the last saved cursor with exponential backoff. The failure counter
//! resets once a session delivers an event; reaching
//! `max_consecutive_failures` makes the subscription fatal.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use super::backoff::Backoff;
use super::cursor::CursorStore;
use super::event::classify;
use super::handler::{TransactionHandler, dispatch};
use crate::config::WatcherConfig;
use crate::error::LedgerError;
use crate::store::{ChangeEvent, DocumentStore, EventFilter, Filter, ResumeCursor, TRANSACTIONS};
use crate::transaction::fields;

/// Operator-visible health of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherStatus {
    Starting,
    Running,
    Reconnecting { failures: u32 },
    Stopped,
    /// Gave up; notifications are no longer delivered
    Fatal { reason: String },
}

impl WatcherStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            WatcherStatus::Starting | WatcherStatus::Running | WatcherStatus::Reconnecting { .. }
        )
    }
}

/// Spawns and owns change feed subscriptions
pub struct ChangeWatcher {
    store: Arc<dyn DocumentStore>,
    cursors: Arc<dyn CursorStore>,
    config: WatcherConfig,
}

impl ChangeWatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cursors: Arc<dyn CursorStore>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            store,
            cursors,
            config,
        }
    }

    /// Start a subscription on the transaction feed
    ///
    /// `name` keys the persisted cursor: subscribing again under the same
    /// name resumes after the last event the previous run processed.
    /// Must be called inside a tokio runtime.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: EventFilter,
        handler: Arc<dyn TransactionHandler>,
    ) -> SubscriptionHandle {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(WatcherStatus::Starting);

        let subscription = Subscription {
            name: name.clone(),
            store: self.store.clone(),
            cursors: self.cursors.clone(),
            filter,
            handler,
            backoff: Backoff::from(&self.config),
            max_failures: self.config.max_consecutive_failures,
            status: status_tx,
            shutdown: shutdown_rx,
            cursor: None,
            cursor_loaded: false,
        };
        let span = info_span!("subscription", name = %name);
        let task = tokio::spawn(subscription.run().instrument(span));

        SubscriptionHandle {
            name,
            shutdown: shutdown_tx,
            status: status_rx,
            task: Some(task),
        }
    }

    /// Inserts and updates of transactions sent or received by `public_key`
    pub fn account_filter(public_key: &str) -> EventFilter {
        EventFilter::inserts_and_updates().with_document(
            Filter::eq(fields::FROM, public_key).or(Filter::eq(fields::TO, public_key)),
        )
    }
}

/// Handle to a running subscription
///
/// Dropping the handle signals the task to stop after its current delivery.
pub struct SubscriptionHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<WatcherStatus>,
    task: Option<JoinHandle<Result<(), LedgerError>>>,
}

impl SubscriptionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> WatcherStatus {
        self.status.borrow().clone()
    }

    /// Receiver for awaiting status changes
    pub fn status_receiver(&self) -> watch::Receiver<WatcherStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop after the in-flight delivery completes, then wait for the task
    pub async fn close(mut self) -> Result<(), LedgerError> {
        self.shutdown.send_replace(true);
        self.wait().await
    }

    /// Wait for the task to end on its own; surfaces `WatcherFatal`
    pub async fn join(mut self) -> Result<(), LedgerError> {
        self.wait().await
    }

    async fn wait(&mut self) -> Result<(), LedgerError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.await.map_err(|e| LedgerError::WatcherFatal {
            failures: 0,
            reason: format!("watcher task aborted: {e}"),
        })?
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Subscription {
    name: String,
    store: Arc<dyn DocumentStore>,
    cursors: Arc<dyn CursorStore>,
    filter: EventFilter,
    handler: Arc<dyn TransactionHandler>,
    backoff: Backoff,
    max_failures: u32,
    status: watch::Sender<WatcherStatus>,
    shutdown: watch::Receiver<bool>,
    /// Last position whose event was fully processed
    cursor: Option<ResumeCursor>,
    cursor_loaded: bool,
}

impl Subscription {
    async fn run(mut self) -> Result<(), LedgerError> {
        info!(subscription = %self.name, "Starting change watcher");
        let mut failures: u32 = 0;

        loop {
            let mut delivered = false;
            let reason = match self.session(&mut delivered).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => reason,
            };

            if delivered {
                failures = 0;
            }
            failures = failures.saturating_add(1);
            let lost = LedgerError::SubscriptionLost(reason.clone());

            if failures >= self.max_failures {
                error!(
                    subscription = %self.name,
                    failures,
                    error = %lost,
                    "Change watcher giving up"
                );
                self.status.send_replace(WatcherStatus::Fatal {
                    reason: reason.clone(),
                });
                return Err(LedgerError::WatcherFatal { failures, reason });
            }

            let delay = self.backoff.delay_for_attempt(failures - 1);
            warn!(
                subscription = %self.name,
                failures,
                delay_ms = delay.as_millis() as u64,
                error = %lost,
                "Change stream lost, resubscribing"
            );
            self.status
                .send_replace(WatcherStatus::Reconnecting { failures });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            }
        }

        self.status.send_replace(WatcherStatus::Stopped);
        info!(subscription = %self.name, "Change watcher stopped");
        Ok(())
    }

    /// One open change stream, until it is lost or shutdown is requested
    async fn session(&mut self, delivered: &mut bool) -> SessionEnd {
        if *self.shutdown.borrow() {
            return SessionEnd::Shutdown;
        }

        if !self.cursor_loaded {
            match self.cursors.load(&self.name).await {
                Ok(cursor) => {
                    self.cursor = cursor;
                    self.cursor_loaded = true;
                }
                Err(e) => return SessionEnd::Lost(format!("cursor load failed: {e}")),
            }
        }

        let mut stream = match self
            .store
            .watch(TRANSACTIONS, &self.filter, self.cursor.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::Lost(e.to_string()),
        };
        self.status.send_replace(WatcherStatus::Running);
        debug!(
            subscription = %self.name,
            resume_from = ?self.cursor.as_ref().map(ResumeCursor::as_str),
            "Change stream opened"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => return SessionEnd::Shutdown,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                None => return SessionEnd::Lost("change stream closed".to_string()),
            };

            // An event in hand is finished even if shutdown arrives meanwhile
            if let Err(reason) = self.deliver(&event).await {
                return SessionEnd::Lost(reason);
            }
            if let Err(e) = self.cursors.save(&self.name, &event.position).await {
                return SessionEnd::Lost(format!("cursor save failed: {e}"));
            }
            self.cursor = Some(event.position);
            *delivered = true;
        }
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<(), String> {
        let classified = match classify(event) {
            Ok(Some(classified)) => classified,
            Ok(None) => {
                trace!(
                    subscription = %self.name,
                    operation = %event.operation,
                    document_key = %event.document_key,
                    "Event ignored"
                );
                return Ok(());
            }
            Err(e) => {
                warn!(
                    subscription = %self.name,
                    document_key = %event.document_key,
                    error = %e,
                    "Skipping undecodable transaction event"
                );
                return Ok(());
            }
        };

        debug!(
            subscription = %self.name,
            tx_hash = %classified.transaction().tx_hash,
            kind = classified.kind(),
            "Dispatching transaction event"
        );
        dispatch(self.handler.as_ref(), &classified)
            .await
            .map_err(|e| format!("handler failed on {}: {e:#}", event.document_key))
    }
}

/// Resolves once shutdown is requested or the handle is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::WriteLevel;
    use crate::store::MemoryStore;
    use crate::transaction::{Transaction, TransactionKind, TransactionStatus};
    use crate::watcher::MemoryCursorStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl TransactionHandler for Noop {}

    fn pending(from: &str, to: &str) -> Transaction {
        Transaction::new(from, to, dec!(1), TransactionKind::Send, TransactionStatus::Pending)
    }

    fn fast_config(max_consecutive_failures: u32) -> WatcherConfig {
        WatcherConfig {
            max_consecutive_failures,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    async fn wait_status(handle: &SubscriptionHandle, want: impl Fn(&WatcherStatus) -> bool) {
        let mut rx = handle.status_receiver();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| want(s)))
            .await
            .expect("status not reached")
            .unwrap();
    }

    #[test]
    fn test_status_health() {
        assert!(WatcherStatus::Starting.is_healthy());
        assert!(WatcherStatus::Reconnecting { failures: 2 }.is_healthy());
        assert!(!WatcherStatus::Stopped.is_healthy());
        assert!(!WatcherStatus::Fatal { reason: "x".into() }.is_healthy());
    }

    #[test]
    fn test_account_filter() {
        let filter = ChangeWatcher::account_filter("0xa");
        assert!(filter.document.matches(&pending("0xb", "0xa").to_document()));
        assert!(filter.document.matches(&pending("0xa", "0xc").to_document()));
        assert!(!filter.document.matches(&pending("0xb", "0xc").to_document()));
    }

    #[tokio::test]
    async fn test_close_reports_stopped() {
        let store = Arc::new(MemoryStore::new());
        let watcher =
            ChangeWatcher::new(store, Arc::new(MemoryCursorStore::new()), fast_config(3));
        let handle = watcher.subscribe("noop", EventFilter::all(), Arc::new(Noop));
        wait_status(&handle, |s| *s == WatcherStatus::Running).await;

        let mut status = handle.status_receiver();
        handle.close().await.unwrap();
        assert_eq!(*status.borrow_and_update(), WatcherStatus::Stopped);
    }

    #[tokio::test]
    async fn test_fatal_after_consecutive_failures() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_watches(100);
        let watcher =
            ChangeWatcher::new(store, Arc::new(MemoryCursorStore::new()), fast_config(3));
        let handle = watcher.subscribe("doomed", EventFilter::all(), Arc::new(Noop));

        wait_status(&handle, |s| matches!(s, WatcherStatus::Fatal { .. })).await;
        match handle.join().await {
            Err(LedgerError::WatcherFatal { failures, .. }) => assert_eq!(failures, 3),
            other => panic!("expected WatcherFatal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_watch_failures_recover() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_watches(2);
        let watcher = ChangeWatcher::new(
            store.clone(),
            Arc::new(MemoryCursorStore::new()),
            fast_config(5),
        );
        let handle = watcher.subscribe("flaky", EventFilter::all(), Arc::new(Noop));
        wait_status(&handle, |s| *s == WatcherStatus::Running).await;

        store
            .insert(TRANSACTIONS, pending("0xa", "0xb").to_document(), WriteLevel::FINANCIAL)
            .await
            .unwrap();
        assert!(handle.status().is_healthy());
        handle.close().await.unwrap();
    }
}
