//! Transactions of the in-memory engine.

use super::store::MemoryObjectStore;
use super::EngineShared;
use crate::engine::{
    EngineObjectStore, EngineTransaction, Request, TransactionEvent, TransactionListener,
    TransactionMode, Value,
};
use crate::error::{EngineError, EngineResult};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

type Listener = Arc<dyn Fn(&TransactionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Committed,
    Aborted,
}

struct TxnState {
    status: Status,
    /// Requests issued but not yet run.
    pending: usize,
    /// Bumped on every issued request; a scheduled commit only proceeds if
    /// nothing was issued since it was scheduled.
    generation: u64,
    /// Sequence number of the next request to issue.
    issued: u64,
    /// Sequence number of the next request allowed to run.
    next_to_run: u64,
    /// Uncommitted writes per store; `None` marks a delete.
    writes: BTreeMap<String, BTreeMap<String, Option<Value>>>,
    listeners: Vec<Listener>,
}

/// Shared state of one transaction.
pub(crate) struct TxnShared {
    pub(crate) id: u64,
    pub(crate) mode: TransactionMode,
    pub(crate) db: String,
    pub(crate) scope: Vec<String>,
    pub(crate) engine: Arc<EngineShared>,
    runtime: Handle,
    state: Mutex<TxnState>,
    /// Signalled when a request of this transaction has run.
    turn: Notify,
}

impl TxnShared {
    /// Creates the transaction and schedules its first commit check, so a
    /// transaction that never receives a request still finishes.
    pub(crate) fn begin(
        id: u64,
        mode: TransactionMode,
        db: String,
        scope: Vec<String>,
        engine: Arc<EngineShared>,
    ) -> EngineResult<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let txn = Arc::new(Self {
            id,
            mode,
            db,
            scope,
            engine,
            runtime,
            state: Mutex::new(TxnState {
                status: Status::Active,
                pending: 0,
                generation: 0,
                issued: 0,
                next_to_run: 0,
                writes: BTreeMap::new(),
                listeners: Vec::new(),
            }),
            turn: Notify::new(),
        });
        debug!(txn = id, mode = %mode, "transaction started");
        txn.schedule_commit(0);
        Ok(txn)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().status == Status::Active
    }

    fn is_aborted(&self) -> bool {
        self.state.lock().status == Status::Aborted
    }

    /// Issues a request whose `work` runs on a spawned task once it is this
    /// request's turn.
    ///
    /// The returned future reports `TransactionAborted` if the transaction
    /// aborted before the caller observed the result.
    pub(crate) fn issue<T, F>(self: &Arc<Self>, work: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<TxnShared>) -> EngineResult<T> + Send + 'static,
    {
        let id = self.id;
        let seq = {
            let mut state = self.state.lock();
            if state.status != Status::Active {
                return futures::future::ready(Err(EngineError::TransactionInactive { id }))
                    .boxed();
            }
            state.pending += 1;
            state.generation += 1;
            state.issued += 1;
            state.issued - 1
        };

        let (tx, rx) = oneshot::channel();
        let txn = Arc::clone(self);
        self.runtime.spawn(async move {
            txn.wait_turn().await;
            txn.wait_sequence(seq).await;
            tokio::task::yield_now().await;

            let result = if txn.is_active() {
                work(&txn)
            } else {
                Err(EngineError::TransactionAborted { id })
            };
            if let Err(err) = &result {
                if !err.is_transaction_end() {
                    txn.fail(err.clone());
                }
            }
            let _ = tx.send(result);
            txn.finish_request();
        });

        let txn = Arc::clone(self);
        async move {
            let result = rx
                .await
                .unwrap_or(Err(EngineError::TransactionAborted { id }));
            match result {
                Ok(_) if txn.is_aborted() => Err(EngineError::TransactionAborted { id }),
                other => other,
            }
        }
        .boxed()
    }

    /// Waits until no older overlapping transaction conflicts with this one.
    async fn wait_turn(&self) {
        loop {
            let notified = self.engine.finished.notified();
            if !self.has_conflict() {
                return;
            }
            notified.await;
        }
    }

    fn has_conflict(&self) -> bool {
        let state = self.engine.state.lock();
        let Some(db) = state.databases.get(&self.db) else {
            return false;
        };
        db.active.range(..self.id).any(|(_, other)| {
            let writes = !self.mode.is_read_only() || !other.mode.is_read_only();
            writes && other.scope.iter().any(|s| self.scope.contains(s))
        })
    }

    async fn wait_sequence(&self, seq: u64) {
        loop {
            let notified = self.turn.notified();
            if self.state.lock().next_to_run == seq {
                return;
            }
            notified.await;
        }
    }

    fn finish_request(self: &Arc<Self>) {
        let schedule = {
            let mut state = self.state.lock();
            state.pending -= 1;
            state.next_to_run += 1;
            (state.pending == 0 && state.status == Status::Active).then_some(state.generation)
        };
        self.turn.notify_waiters();
        if let Some(generation) = schedule {
            self.schedule_commit(generation);
        }
    }

    fn schedule_commit(self: &Arc<Self>, generation: u64) {
        let txn = Arc::clone(self);
        self.runtime.spawn(async move {
            // Give observers of the last request a turn to issue more work.
            tokio::task::yield_now().await;
            txn.wait_turn().await;
            txn.commit(generation);
        });
    }

    fn commit(&self, generation: u64) {
        let listeners = {
            let mut state = self.state.lock();
            if state.status != Status::Active
                || state.pending != 0
                || state.generation != generation
            {
                return;
            }

            let writes = std::mem::take(&mut state.writes);
            {
                let mut engine = self.engine.state.lock();
                if let Some(db) = engine.databases.get_mut(&self.db) {
                    for (store, records) in writes {
                        let Some(store) = db.stores.get_mut(&store) else {
                            continue;
                        };
                        for (key, value) in records {
                            match value {
                                Some(value) => {
                                    store.records.insert(key, value);
                                }
                                None => {
                                    store.records.remove(&key);
                                }
                            }
                        }
                    }
                    db.active.remove(&self.id);
                }
            }
            state.status = Status::Committed;
            state.listeners.clone()
        };

        debug!(txn = self.id, mode = %self.mode, "transaction committed");
        for listener in &listeners {
            listener(&TransactionEvent::Complete);
        }
        self.engine.finished.notify_waiters();
    }

    pub(crate) fn abort(&self) -> EngineResult<()> {
        let listeners = {
            let mut state = self.state.lock();
            if state.status != Status::Active {
                return Err(EngineError::TransactionInactive { id: self.id });
            }
            state.status = Status::Aborted;
            state.writes.clear();
            if let Some(db) = self.engine.state.lock().databases.get_mut(&self.db) {
                db.active.remove(&self.id);
            }
            state.listeners.clone()
        };

        debug!(txn = self.id, mode = %self.mode, "transaction aborted");
        for listener in &listeners {
            listener(&TransactionEvent::Abort);
        }
        self.engine.finished.notify_waiters();
        Ok(())
    }

    /// Reports a failed request and aborts the transaction.
    fn fail(&self, err: EngineError) {
        let listeners = self.state.lock().listeners.clone();
        trace!(txn = self.id, error = %err, "request failed");
        let event = TransactionEvent::Error(err);
        for listener in &listeners {
            listener(&event);
        }
        let _ = self.abort();
    }

    fn listen(&self, listener: TransactionListener) {
        self.state.lock().listeners.push(Arc::from(listener));
    }

    /// Returns the uncommitted write for `key`, if any.
    ///
    /// The outer `None` means "not written in this transaction"; the inner
    /// `None` is a pending delete.
    pub(crate) fn written(&self, store: &str, key: &str) -> Option<Option<Value>> {
        self.state
            .lock()
            .writes
            .get(store)
            .and_then(|records| records.get(key).cloned())
    }

    /// Returns the uncommitted writes of `store`.
    pub(crate) fn writes_of(&self, store: &str) -> BTreeMap<String, Option<Value>> {
        self.state
            .lock()
            .writes
            .get(store)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn record_write(&self, store: &str, key: String, value: Option<Value>) {
        self.state
            .lock()
            .writes
            .entry(store.to_string())
            .or_default()
            .insert(key, value);
    }
}

/// A transaction of the in-memory engine.
pub struct MemoryTransaction {
    shared: Arc<TxnShared>,
}

impl MemoryTransaction {
    pub(crate) fn new(shared: Arc<TxnShared>) -> Self {
        Self { shared }
    }
}

impl EngineTransaction for MemoryTransaction {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn mode(&self) -> TransactionMode {
        self.shared.mode
    }

    fn is_live(&self) -> bool {
        self.shared.is_active()
    }

    fn object_store(&self, name: &str) -> EngineResult<Arc<dyn EngineObjectStore>> {
        if !self.shared.scope.iter().any(|s| s == name) {
            return Err(EngineError::store_not_found(name));
        }
        let key_path = self
            .shared
            .engine
            .state
            .lock()
            .databases
            .get(&self.shared.db)
            .and_then(|db| db.stores.get(name))
            .map(|store| store.key_path.clone())
            .ok_or_else(|| EngineError::store_not_found(name))?;
        Ok(Arc::new(MemoryObjectStore::new(
            Arc::clone(&self.shared),
            name.to_string(),
            key_path,
        )))
    }

    fn listen(&self, listener: TransactionListener) {
        self.shared.listen(listener);
    }

    fn abort(&self) -> EngineResult<()> {
        self.shared.abort()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{Engine, EngineConnection, SchemaUpgrade, TransactionEvent};
    use crate::{EngineError, MemoryEngine, TransactionMode};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    async fn open(engine: &MemoryEngine) -> Arc<dyn EngineConnection> {
        engine
            .open(
                "db",
                1,
                Box::new(|up: &mut dyn SchemaUpgrade| {
                    up.create_object_store("items", "key")?;
                    up.create_index("items", "key", "key", true)
                }),
            )
            .await
            .unwrap()
    }

    async fn settle(engine: &MemoryEngine) {
        while engine.active_transactions("db") > 0 {
            tokio::task::yield_now().await;
        }
    }

    fn record(
        txn: &Arc<dyn crate::EngineTransaction>,
    ) -> Arc<Mutex<Vec<TransactionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        txn.listen(Box::new(move |event| sink.lock().push(event.clone())));
        events
    }

    #[tokio::test]
    async fn write_commits_after_requests_finish() {
        let engine = MemoryEngine::new();
        let conn = open(&engine).await;
        let txn = conn.transaction(&["items"], TransactionMode::ReadWrite).unwrap();
        let events = record(&txn);
        let store = txn.object_store("items").unwrap();

        let key = store.put(json!({ "key": "a", "value": 1 })).await.unwrap();
        assert_eq!(key, "a");
        settle(&engine).await;

        assert!(!txn.is_live());
        assert_eq!(*events.lock(), vec![TransactionEvent::Complete]);
        assert_eq!(engine.record_count("db", "items"), 1);
    }

    #[tokio::test]
    async fn empty_transaction_completes() {
        let engine = MemoryEngine::new();
        let conn = open(&engine).await;
        let txn = conn.transaction(&["items"], TransactionMode::ReadOnly).unwrap();
        let events = record(&txn);
        settle(&engine).await;

        assert_eq!(*events.lock(), vec![TransactionEvent::Complete]);
    }

    #[tokio::test]
    async fn requests_in_same_turn_share_one_commit() {
        let engine = MemoryEngine::new();
        let conn = open(&engine).await;
        let txn = conn.transaction(&["items"], TransactionMode::ReadWrite).unwrap();
        let events = record(&txn);
        let store = txn.object_store("items").unwrap();

        let a = store.put(json!({ "key": "a" }));
        let b = store.put(json!({ "key": "b" }));
        assert_eq!(a.await.unwrap(), "a");
        assert_eq!(b.await.unwrap(), "b");
        settle(&engine).await;

        assert_eq!(*events.lock(), vec![TransactionEvent::Complete]);
        assert_eq!(engine.record_count("db", "items"), 2);
    }

    #[tokio::test]
    async fn abort_discards_writes_and_fails_unobserved_requests() {
        let engine = MemoryEngine::new();
        let conn = open(&engine).await;
        let txn = conn.transaction(&["items"], TransactionMode::ReadWrite).unwrap();
        let events = record(&txn);
        let store = txn.object_store("items").unwrap();

        let pending = store.put(json!({ "key": "a" }));
        txn.abort().unwrap();

        assert!(matches!(
            pending.await,
            Err(EngineError::TransactionAborted { .. })
        ));
        assert_eq!(*events.lock(), vec![TransactionEvent::Abort]);
        assert!(matches!(
            txn.abort(),
            Err(EngineError::TransactionInactive { .. })
        ));
        settle(&engine).await;
        assert_eq!(engine.record_count("db", "items"), 0);
    }

    #[tokio::test]
    async fn request_after_finish_is_inactive() {
        let engine = MemoryEngine::new();
        let conn = open(&engine).await;
        let txn = conn.transaction(&["items"], TransactionMode::ReadWrite).unwrap();
        let store = txn.object_store("items").unwrap();
        settle(&engine).await;

        assert!(matches!(
            store.get("a").await,
            Err(EngineError::TransactionInactive { .. })
        ));
    }

    #[tokio::test]
    async fn failed_request_raises_error_then_abort() {
        let engine = MemoryEngine::new();
        let conn = open(&engine).await;
        let txn = conn.transaction(&["items"], TransactionMode::ReadWrite).unwrap();
        let events = record(&txn);
        let store = txn.object_store("items").unwrap();

        let result = store.put(json!({ "value": "no key" })).await;
        assert!(matches!(result, Err(EngineError::DataError(_))));

        let events = events.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TransactionEvent::Error(_)));
        assert_eq!(events[1], TransactionEvent::Abort);
    }

    #[tokio::test]
    async fn reader_waits_for_older_writer() {
        let engine = MemoryEngine::new();
        let conn = open(&engine).await;

        let writer = conn.transaction(&["items"], TransactionMode::ReadWrite).unwrap();
        let put = writer
            .object_store("items")
            .unwrap()
            .put(json!({ "key": "a", "value": 1 }));

        let reader = conn.transaction(&["items"], TransactionMode::ReadOnly).unwrap();
        let get = reader.object_store("items").unwrap().get("a");

        // The read is issued before the write is observed, yet sees it.
        assert_eq!(
            get.await.unwrap(),
            Some(json!({ "key": "a", "value": 1 }))
        );
        put.await.unwrap();
    }

    #[tokio::test]
    async fn readonly_transaction_rejects_writes() {
        let engine = MemoryEngine::new();
        let conn = open(&engine).await;
        let txn = conn.transaction(&["items"], TransactionMode::ReadOnly).unwrap();
        let store = txn.object_store("items").unwrap();

        assert!(matches!(
            store.put(json!({ "key": "a" })).await,
            Err(EngineError::ReadOnly { .. })
        ));
        assert!(matches!(
            store.delete("a").await,
            Err(EngineError::ReadOnly { .. })
        ));
    }
}
