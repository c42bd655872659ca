//! In-Memory Document Store
//!
//! Complete implementation of the storage port backed by process memory.
//! A single lock linearizes every write, which gives the same per-document
//! compare-and-swap guarantee a replica-set primary gives.
//!
//! Every mutation is appended to an ordered oplog; change streams read the
//! oplog from their position and park on a `watch` channel when caught up.
//! Without a resume cursor a stream replays the retained oplog from the
//! first entry. The oplog keeps the newest `oplog_capacity` entries; a
//! stream resuming from a trimmed position fails with `InvalidCursor`.
//!
//! The write/read level journal is off unless enabled with
//! [`MemoryStore::record_levels`] (on by default in unit tests).
//!
//! Fault injection hooks (`fail_next_watches`, `drop_watchers`,
//! `fail_updates`) exist for recovery and reconnect testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::document::{Document, Filter, ID_FIELD, Update};
use super::{
    ChangeEvent, ChangeStream, DocumentStore, EventFilter, OperationType, ResumeCursor,
    StoreError, UpdateResult,
};
use crate::policy::{ReadLevel, WriteLevel};

/// Change events retained for replay and resume
pub const DEFAULT_OPLOG_CAPACITY: usize = 100_000;

#[derive(Debug)]
struct OplogEntry {
    collection: String,
    event: ChangeEvent,
}

#[derive(Debug, Default)]
struct UpdateFault {
    skip: usize,
    fail: usize,
}

struct State {
    collections: HashMap<String, BTreeMap<String, Document>>,
    unique: HashMap<String, Vec<String>>,
    /// seq of entry `i` is `oplog_base + i + 1`
    oplog: VecDeque<OplogEntry>,
    /// Entries trimmed from the front so far
    oplog_base: u64,
    oplog_capacity: usize,
    /// Bumped by `drop_watchers`; streams opened under an older epoch end
    epoch: u64,
    failing_watches: u32,
    update_faults: HashMap<String, UpdateFault>,
    journal_levels: bool,
    writes: Vec<(String, WriteLevel)>,
    reads: Vec<(String, ReadLevel)>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            collections: HashMap::new(),
            unique: HashMap::new(),
            oplog: VecDeque::new(),
            oplog_base: 0,
            oplog_capacity: DEFAULT_OPLOG_CAPACITY,
            epoch: 0,
            failing_watches: 0,
            update_faults: HashMap::new(),
            journal_levels: cfg!(test),
            writes: Vec::new(),
            reads: Vec::new(),
        }
    }
}

impl State {
    fn last_seq(&self) -> u64 {
        self.oplog_base + self.oplog.len() as u64
    }

    fn record_write(&mut self, collection: &str, level: WriteLevel) {
        if self.journal_levels {
            self.writes.push((collection.to_string(), level));
        }
    }

    fn record_read(&mut self, collection: &str, level: ReadLevel) {
        if self.journal_levels {
            self.reads.push((collection.to_string(), level));
        }
    }

    fn take_update_fault(&mut self, collection: &str) -> Result<(), StoreError> {
        if let Some(fault) = self.update_faults.get_mut(collection) {
            if fault.skip > 0 {
                fault.skip -= 1;
            } else if fault.fail > 0 {
                fault.fail -= 1;
                return Err(StoreError::Unavailable(format!(
                    "injected update failure on {collection}"
                )));
            }
        }
        Ok(())
    }

    fn check_unique(
        &self,
        collection: &str,
        doc: &Document,
        docs: &BTreeMap<String, Document>,
    ) -> Result<(), StoreError> {
        let Some(fields) = self.unique.get(collection) else {
            return Ok(());
        };
        for field in fields {
            let Some(value) = doc.get(field) else {
                continue;
            };
            if docs.values().any(|d| d.get(field) == Some(value)) {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    key: format!("{field}={value:?}"),
                });
            }
        }
        Ok(())
    }

    fn append(&mut self, collection: &str, operation: OperationType, doc: &Document) -> u64 {
        let seq = self.last_seq() + 1;
        self.oplog.push_back(OplogEntry {
            collection: collection.to_string(),
            event: ChangeEvent {
                operation,
                document_key: doc.id().unwrap_or_default().to_string(),
                full_document: Some(doc.clone()),
                position: encode_cursor(seq),
            },
        });
        while self.oplog.len() > self.oplog_capacity {
            self.oplog.pop_front();
            self.oplog_base += 1;
        }
        seq
    }
}

struct Inner {
    state: Mutex<State>,
    /// Latest oplog sequence, bumped on every append
    feed: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory document store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                feed,
            }),
        }
    }

    /// Store with the unique indexes the ledger relies on
    pub fn with_ledger_indexes() -> Self {
        let store = Self::new();
        store.add_unique_index(super::USERS, "publicKey");
        store.add_unique_index(super::TRANSACTIONS, "txHash");
        store
    }

    /// Retain at most `capacity` change events (at least one)
    pub fn with_oplog_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.inner.lock();
            state.oplog_capacity = capacity.max(1);
            while state.oplog.len() > state.oplog_capacity {
                state.oplog.pop_front();
                state.oplog_base += 1;
            }
        }
        self
    }

    /// Turn the write/read level journal on or off
    pub fn record_levels(self, enabled: bool) -> Self {
        {
            let mut state = self.inner.lock();
            state.journal_levels = enabled;
            if !enabled {
                state.writes.clear();
                state.reads.clear();
            }
        }
        self
    }

    pub fn add_unique_index(&self, collection: &str, field: &str) {
        self.inner
            .lock()
            .unique
            .entry(collection.to_string())
            .or_default()
            .push(field.to_string());
    }

    /// Read a document directly, bypassing the read journal
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.inner
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of change events currently retained
    pub fn oplog_len(&self) -> usize {
        self.inner.lock().oplog.len()
    }

    /// Write levels used against `collection`, in call order
    pub fn write_levels(&self, collection: &str) -> Vec<WriteLevel> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|(c, _)| c == collection)
            .map(|(_, level)| *level)
            .collect()
    }

    /// Read levels used against `collection`, in call order
    pub fn read_levels(&self, collection: &str) -> Vec<ReadLevel> {
        self.inner
            .lock()
            .reads
            .iter()
            .filter(|(c, _)| c == collection)
            .map(|(_, level)| *level)
            .collect()
    }

    /// The next `count` calls to `watch` fail with `Unavailable`
    pub fn fail_next_watches(&self, count: u32) {
        self.inner.lock().failing_watches = count;
    }

    /// Terminate every open change stream with `ConnectionLost`
    pub fn drop_watchers(&self) {
        let seq = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.last_seq()
        };
        self.inner.feed.send_replace(seq);
    }

    /// Let `skip` update calls on `collection` through, then fail the next `fail`
    pub fn fail_updates(&self, collection: &str, skip: usize, fail: usize) {
        self.inner
            .lock()
            .update_faults
            .insert(collection.to_string(), UpdateFault { skip, fail });
    }

    fn notify(&self, seq: u64) {
        self.inner.feed.send_replace(seq);
    }
}

fn encode_cursor(seq: u64) -> ResumeCursor {
    ResumeCursor::new(format!("{seq:020}"))
}

fn decode_cursor(cursor: &ResumeCursor) -> Result<u64, StoreError> {
    cursor
        .as_str()
        .parse::<u64>()
        .map_err(|_| StoreError::InvalidCursor(cursor.to_string()))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        level: WriteLevel,
    ) -> Result<UpdateResult, StoreError> {
        let seq = {
            let mut state = self.inner.lock();
            state.take_update_fault(collection)?;
            state.record_write(collection, level);

            let docs = state.collections.entry(collection.to_string()).or_default();
            let Some((id, current)) = docs.iter().find(|(_, d)| filter.matches(d)) else {
                trace!(collection, ?filter, "update_one matched nothing");
                return Ok(UpdateResult::default());
            };
            let next = update.apply(current)?;
            if &next == current {
                return Ok(UpdateResult {
                    matched: 1,
                    modified: 0,
                });
            }
            let id = id.clone();
            docs.insert(id, next.clone());
            state.append(collection, OperationType::Update, &next)
        };
        self.notify(seq);
        Ok(UpdateResult {
            matched: 1,
            modified: 1,
        })
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        level: WriteLevel,
    ) -> Result<UpdateResult, StoreError> {
        let (result, seq) = {
            let mut state = self.inner.lock();
            state.take_update_fault(collection)?;
            state.record_write(collection, level);

            let docs = state.collections.entry(collection.to_string()).or_default();
            let mut changed = Vec::new();
            let mut matched = 0u64;
            for (id, current) in docs.iter() {
                if !filter.matches(current) {
                    continue;
                }
                matched += 1;
                let next = update.apply(current)?;
                if &next != current {
                    changed.push((id.clone(), next));
                }
            }
            let modified = changed.len() as u64;
            for (id, next) in &changed {
                docs.insert(id.clone(), next.clone());
            }
            let mut seq = state.last_seq();
            for (_, next) in &changed {
                seq = state.append(collection, OperationType::Update, next);
            }
            (UpdateResult { matched, modified }, seq)
        };
        if result.modified > 0 {
            self.notify(seq);
        }
        Ok(result)
    }

    async fn insert(
        &self,
        collection: &str,
        mut document: Document,
        level: WriteLevel,
    ) -> Result<String, StoreError> {
        let id = match document.id() {
            Some(id) => id.to_string(),
            None => {
                let id = ulid::Ulid::new().to_string();
                document.insert(ID_FIELD, id.as_str());
                id
            }
        };

        let seq = {
            let mut state = self.inner.lock();
            state.record_write(collection, level);

            let docs = state.collections.get(collection);
            if docs.is_some_and(|d| d.contains_key(&id)) {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    key: format!("{ID_FIELD}={id}"),
                });
            }
            if let Some(docs) = docs {
                state.check_unique(collection, &document, docs)?;
            }
            state
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.clone(), document.clone());
            state.append(collection, OperationType::Insert, &document)
        };
        self.notify(seq);
        debug!(collection, id = %id, "document inserted");
        Ok(id)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        level: ReadLevel,
    ) -> Result<Option<Document>, StoreError> {
        let mut state = self.inner.lock();
        state.record_read(collection, level);
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.values().find(|d| filter.matches(d)).cloned()))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        level: ReadLevel,
    ) -> Result<Vec<Document>, StoreError> {
        let mut state = self.inner.lock();
        state.record_read(collection, level);
        Ok(state
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|d| filter.matches(d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch(
        &self,
        collection: &str,
        filter: &EventFilter,
        resume_from: Option<ResumeCursor>,
    ) -> Result<ChangeStream, StoreError> {
        let resume_after = resume_from.as_ref().map(decode_cursor).transpose()?;

        let (after, epoch) = {
            let mut state = self.inner.lock();
            if state.failing_watches > 0 {
                state.failing_watches -= 1;
                return Err(StoreError::Unavailable(format!(
                    "injected watch failure on {collection}"
                )));
            }
            (resume_after.unwrap_or(state.oplog_base), state.epoch)
        };

        let cursor = FeedCursor {
            inner: self.inner.clone(),
            rx: self.inner.feed.subscribe(),
            collection: collection.to_string(),
            filter: filter.clone(),
            after,
            epoch,
            done: false,
        };
        debug!(collection, after, "change stream opened");

        Ok(Box::pin(futures::stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            loop {
                cursor.rx.borrow_and_update();
                match cursor.poll_next() {
                    Some(Ok(event)) => return Some((Ok(event), cursor)),
                    Some(Err(e)) => {
                        cursor.done = true;
                        return Some((Err(e), cursor));
                    }
                    None => {
                        if cursor.rx.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })))
    }
}

struct FeedCursor {
    inner: Arc<Inner>,
    rx: watch::Receiver<u64>,
    collection: String,
    filter: EventFilter,
    /// Last sequence handed out or skipped
    after: u64,
    epoch: u64,
    done: bool,
}

impl FeedCursor {
    fn poll_next(&mut self) -> Option<Result<ChangeEvent, StoreError>> {
        let state = self.inner.lock();
        if state.epoch != self.epoch {
            return Some(Err(StoreError::ConnectionLost(format!(
                "change stream on {} dropped",
                self.collection
            ))));
        }
        if self.after < state.oplog_base {
            return Some(Err(StoreError::InvalidCursor(format!(
                "position {} on {} is no longer retained",
                self.after, self.collection
            ))));
        }
        let start = usize::try_from(self.after - state.oplog_base).unwrap_or(usize::MAX);
        for entry in state.oplog.iter().skip(start) {
            self.after += 1;
            if entry.collection == self.collection && self.filter.matches(&entry.event) {
                return Some(Ok(entry.event.clone()));
            }
        }
        None
    }
}
