//! Per-mode transaction cache.

use crate::error::CoreResult;
use crate::events::{Event, EventBus};
use crate::item::{RequestEvent, RequestKind};
use dex_engine::{
    EngineConnection, EngineObjectStore, EngineTransaction, TransactionEvent, TransactionMode,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

type Slots = Mutex<HashMap<TransactionMode, Arc<dyn EngineTransaction>>>;

/// An object store handle together with the transaction it belongs to.
pub(crate) struct PooledStore {
    pub(crate) transaction: u64,
    pub(crate) mode: TransactionMode,
    pub(crate) store: Arc<dyn EngineObjectStore>,
}

impl PooledStore {
    /// Builds the completion notification for a request of `kind`.
    pub(crate) fn event(&self, kind: RequestKind) -> RequestEvent {
        RequestEvent {
            kind,
            transaction: self.transaction,
            mode: self.mode,
            store: self.store.name().to_string(),
        }
    }
}

/// Caches at most one live transaction per mode.
///
/// Operations issued while a transaction is cached join it, so they commit
/// or abort together. The slot is cleared when the engine reports the
/// transaction's completion or abort, and the matching event is published.
pub(crate) struct TransactionPool {
    store_name: String,
    events: Arc<EventBus>,
    slots: Arc<Slots>,
}

impl TransactionPool {
    pub(crate) fn new(store_name: impl Into<String>, events: Arc<EventBus>) -> Self {
        Self {
            store_name: store_name.into(),
            events,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the cached transaction for `mode`, opening one if needed.
    pub(crate) fn transaction(
        &self,
        conn: &dyn EngineConnection,
        mode: TransactionMode,
    ) -> CoreResult<Arc<dyn EngineTransaction>> {
        let mut slots = self.slots.lock();
        if let Some(txn) = slots.get(&mode) {
            if txn.is_live() {
                return Ok(Arc::clone(txn));
            }
        }

        let txn = conn.transaction(&[self.store_name.as_str()], mode)?;
        debug!(txn = txn.id(), "created {mode} transaction");
        txn.listen(Self::listener(
            Arc::downgrade(&self.slots),
            Arc::clone(&self.events),
            txn.id(),
            mode,
        ));
        slots.insert(mode, Arc::clone(&txn));
        Ok(txn)
    }

    /// Returns the object store of the cached transaction for `mode`.
    pub(crate) fn store(
        &self,
        conn: &dyn EngineConnection,
        mode: TransactionMode,
    ) -> CoreResult<PooledStore> {
        let txn = self.transaction(conn, mode)?;
        Ok(PooledStore {
            transaction: txn.id(),
            mode,
            store: txn.object_store(&self.store_name)?,
        })
    }

    /// Aborts the cached transaction for `mode`. Returns false if there was
    /// no live transaction to abort.
    pub(crate) fn abort(&self, mode: TransactionMode) -> bool {
        // The abort listener locks the slots, so the lock must be released.
        let txn = self.slots.lock().get(&mode).cloned();
        txn.is_some_and(|txn| txn.abort().is_ok())
    }

    /// Id of the cached transaction for `mode`, if any.
    pub(crate) fn cached(&self, mode: TransactionMode) -> Option<u64> {
        self.slots
            .lock()
            .get(&mode)
            .filter(|txn| txn.is_live())
            .map(|txn| txn.id())
    }

    /// Forgets every cached transaction.
    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }

    fn listener(
        slots: Weak<Slots>,
        events: Arc<EventBus>,
        id: u64,
        mode: TransactionMode,
    ) -> Box<dyn Fn(&TransactionEvent) + Send + Sync> {
        Box::new(move |event| {
            let published = match event {
                TransactionEvent::Complete => {
                    debug!(txn = id, "transaction {mode} completed");
                    Event::Complete {
                        transaction: id,
                        mode,
                    }
                }
                TransactionEvent::Abort => {
                    debug!(txn = id, "transaction {mode} aborted");
                    Event::Abort {
                        transaction: id,
                        mode,
                    }
                }
                TransactionEvent::Error(err) => Event::Error {
                    message: err.to_string(),
                },
            };

            if !matches!(event, TransactionEvent::Error(_)) {
                if let Some(slots) = slots.upgrade() {
                    let mut slots = slots.lock();
                    if slots.get(&mode).is_some_and(|txn| txn.id() == id) {
                        slots.remove(&mode);
                    }
                }
            }
            events.publish(published);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use dex_engine::{Engine, MemoryEngine, SchemaUpgrade};
    use serde_json::json;

    async fn setup() -> (MemoryEngine, Arc<dyn EngineConnection>, Arc<EventBus>, TransactionPool) {
        let engine = MemoryEngine::new();
        let conn = engine
            .open(
                "db",
                1,
                Box::new(|up: &mut dyn SchemaUpgrade| up.create_object_store("__dex__", "key")),
            )
            .await
            .unwrap();
        let events = Arc::new(EventBus::new());
        let pool = TransactionPool::new("__dex__", Arc::clone(&events));
        (engine, conn, events, pool)
    }

    async fn settle(engine: &MemoryEngine) {
        while engine.active_transactions("db") > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn reuses_live_transaction_per_mode() {
        let (_engine, conn, _events, pool) = setup().await;

        let a = pool.transaction(conn.as_ref(), TransactionMode::ReadWrite).unwrap();
        let b = pool.transaction(conn.as_ref(), TransactionMode::ReadWrite).unwrap();
        let c = pool.transaction(conn.as_ref(), TransactionMode::ReadOnly).unwrap();

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(pool.cached(TransactionMode::ReadWrite), Some(a.id()));
    }

    #[tokio::test]
    async fn completion_clears_slot_and_publishes() {
        let (engine, conn, events, pool) = setup().await;

        let target = pool.store(conn.as_ref(), TransactionMode::ReadWrite).unwrap();
        target.store.put(json!({ "key": "a" })).await.unwrap();
        settle(&engine).await;

        assert_eq!(pool.cached(TransactionMode::ReadWrite), None);
        assert_eq!(
            events.history_of(EventKind::Complete),
            vec![Event::Complete {
                transaction: target.transaction,
                mode: TransactionMode::ReadWrite,
            }]
        );

        let next = pool.store(conn.as_ref(), TransactionMode::ReadWrite).unwrap();
        assert_ne!(next.transaction, target.transaction);
    }

    #[tokio::test]
    async fn abort_publishes_once_and_clears_slot() {
        let (_engine, conn, events, pool) = setup().await;
        let txn = pool.transaction(conn.as_ref(), TransactionMode::ReadWrite).unwrap();

        assert!(pool.abort(TransactionMode::ReadWrite));
        assert!(!pool.abort(TransactionMode::ReadWrite));

        assert_eq!(
            events.history_of(EventKind::Abort),
            vec![Event::Abort {
                transaction: txn.id(),
                mode: TransactionMode::ReadWrite,
            }]
        );
        assert_eq!(pool.cached(TransactionMode::ReadWrite), None);
    }

    #[tokio::test]
    async fn failed_request_publishes_error_then_abort() {
        let (_engine, conn, events, pool) = setup().await;
        let target = pool.store(conn.as_ref(), TransactionMode::ReadWrite).unwrap();

        assert!(target.store.put(json!({ "no": "key" })).await.is_err());

        let kinds: Vec<_> = events.history().iter().map(Event::kind).collect();
        assert_eq!(kinds, vec![EventKind::Error, EventKind::Abort]);
    }

    #[tokio::test]
    async fn request_event_describes_the_transaction() {
        let (_engine, conn, _events, pool) = setup().await;
        let target = pool.store(conn.as_ref(), TransactionMode::ReadOnly).unwrap();

        let event = target.event(RequestKind::Get);
        assert_eq!(event.transaction, target.transaction);
        assert_eq!(event.mode, TransactionMode::ReadOnly);
        assert_eq!(event.store, "__dex__");
    }
}
