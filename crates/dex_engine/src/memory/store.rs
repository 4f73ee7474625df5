//! Object stores, indexes and cursors of the in-memory engine.

use super::transaction::TxnShared;
use super::IndexDef;
use crate::engine::{extract_key, EngineIndex, EngineObjectStore, KeyCursor, Request, Value};
use crate::error::{EngineError, EngineResult};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An object store seen through a [`super::transaction::MemoryTransaction`].
pub struct MemoryObjectStore {
    txn: Arc<TxnShared>,
    name: String,
    key_path: String,
}

impl MemoryObjectStore {
    pub(crate) fn new(txn: Arc<TxnShared>, name: String, key_path: String) -> Self {
        Self {
            txn,
            name,
            key_path,
        }
    }

    fn read_only_error<T: Send + 'static>(&self) -> Option<Request<T>> {
        self.txn.mode.is_read_only().then(|| {
            futures::future::ready(Err(EngineError::ReadOnly { id: self.txn.id })).boxed()
        })
    }
}

impl EngineObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_path(&self) -> &str {
        &self.key_path
    }

    fn put(&self, value: Value) -> Request<String> {
        if let Some(err) = self.read_only_error() {
            return err;
        }
        let store = self.name.clone();
        let key_path = self.key_path.clone();

        self.txn.issue(move |txn| {
            let key = extract_key(&value, &key_path)?;
            check_unique(txn, &store, &key, &value)?;
            txn.record_write(&store, key.clone(), Some(value));
            Ok(key)
        })
    }

    fn get(&self, key: &str) -> Request<Option<Value>> {
        let store = self.name.clone();
        let key = key.to_string();

        self.txn.issue(move |txn| {
            if let Some(written) = txn.written(&store, &key) {
                return Ok(written);
            }
            let state = txn.engine.state.lock();
            let records = &state
                .databases
                .get(&txn.db)
                .and_then(|db| db.stores.get(&store))
                .ok_or_else(|| EngineError::store_not_found(store.as_str()))?
                .records;
            Ok(records.get(&key).cloned())
        })
    }

    fn delete(&self, key: &str) -> Request<()> {
        if let Some(err) = self.read_only_error() {
            return err;
        }
        let store = self.name.clone();
        let key = key.to_string();

        self.txn.issue(move |txn| {
            txn.record_write(&store, key, None);
            Ok(())
        })
    }

    fn index(&self, name: &str) -> EngineResult<Arc<dyn EngineIndex>> {
        let def = index_defs(&self.txn, &self.name)?
            .remove(name)
            .ok_or_else(|| EngineError::IndexNotFound {
                name: name.to_string(),
            })?;
        Ok(Arc::new(MemoryIndex {
            txn: Arc::clone(&self.txn),
            store: self.name.clone(),
            name: name.to_string(),
            def,
        }))
    }

    fn open_key_cursor(&self) -> Request<Option<Box<dyn KeyCursor>>> {
        step(&self.txn, self.name.clone(), None, None)
    }
}

/// An index seen through a transaction.
pub struct MemoryIndex {
    txn: Arc<TxnShared>,
    store: String,
    name: String,
    def: IndexDef,
}

impl EngineIndex for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_path(&self) -> &str {
        &self.def.key_path
    }

    fn unique(&self) -> bool {
        self.def.unique
    }

    fn open_key_cursor(&self) -> Request<Option<Box<dyn KeyCursor>>> {
        step(
            &self.txn,
            self.store.clone(),
            Some(self.def.key_path.clone()),
            None,
        )
    }
}

/// A key cursor positioned on one record.
struct MemoryKeyCursor {
    txn: Arc<TxnShared>,
    store: String,
    /// Key path of the index, `None` for primary-key cursors.
    index_path: Option<String>,
    key: String,
    primary_key: String,
}

impl KeyCursor for MemoryKeyCursor {
    fn key(&self) -> &str {
        &self.key
    }

    fn primary_key(&self) -> &str {
        &self.primary_key
    }

    fn advance(self: Box<Self>) -> Request<Option<Box<dyn KeyCursor>>> {
        let cursor = *self;
        step(
            &cursor.txn,
            cursor.store,
            cursor.index_path,
            Some((cursor.key, cursor.primary_key)),
        )
    }
}

/// Issues one cursor step: finds the first position after `after`.
fn step(
    txn: &Arc<TxnShared>,
    store: String,
    index_path: Option<String>,
    after: Option<(String, String)>,
) -> Request<Option<Box<dyn KeyCursor>>> {
    txn.issue(move |txn| {
        let positions = positions(txn, &store, index_path.as_deref())?;
        let next = positions
            .into_iter()
            .find(|position| after.as_ref().map_or(true, |after| position > after));

        Ok(next.map(|(key, primary_key)| {
            Box::new(MemoryKeyCursor {
                txn: Arc::clone(txn),
                store,
                index_path,
                key,
                primary_key,
            }) as Box<dyn KeyCursor>
        }))
    })
}

/// Sorted `(cursor key, primary key)` pairs visible to the transaction.
fn positions(
    txn: &TxnShared,
    store: &str,
    index_path: Option<&str>,
) -> EngineResult<Vec<(String, String)>> {
    let records = visible_records(txn, store)?;
    let mut positions: Vec<(String, String)> = match index_path {
        None => records.into_keys().map(|k| (k.clone(), k)).collect(),
        Some(path) => records
            .iter()
            .filter_map(|(pk, record)| {
                extract_key(record, path)
                    .ok()
                    .map(|index_key| (index_key, pk.clone()))
            })
            .collect(),
    };
    positions.sort();
    Ok(positions)
}

/// Committed records overlaid with the transaction's own writes.
fn visible_records(txn: &TxnShared, store: &str) -> EngineResult<BTreeMap<String, Value>> {
    let writes = txn.writes_of(store);
    let mut records = {
        let state = txn.engine.state.lock();
        state
            .databases
            .get(&txn.db)
            .and_then(|db| db.stores.get(store))
            .map(|s| s.records.clone())
            .ok_or_else(|| EngineError::store_not_found(store))?
    };
    for (key, value) in writes {
        match value {
            Some(value) => {
                records.insert(key, value);
            }
            None => {
                records.remove(&key);
            }
        }
    }
    Ok(records)
}

fn index_defs(txn: &TxnShared, store: &str) -> EngineResult<BTreeMap<String, IndexDef>> {
    let state = txn.engine.state.lock();
    state
        .databases
        .get(&txn.db)
        .and_then(|db| db.stores.get(store))
        .map(|s| s.indexes.clone())
        .ok_or_else(|| EngineError::store_not_found(store))
}

/// Fails if a unique index already maps `value`'s index key to another record.
fn check_unique(txn: &TxnShared, store: &str, key: &str, value: &Value) -> EngineResult<()> {
    let indexes = index_defs(txn, store)?;
    if !indexes.values().any(|def| def.unique) {
        return Ok(());
    }

    let records = visible_records(txn, store)?;
    for (name, def) in indexes.iter().filter(|(_, def)| def.unique) {
        let Ok(index_key) = extract_key(value, &def.key_path) else {
            continue;
        };
        let taken = records.iter().any(|(pk, record)| {
            pk != key
                && extract_key(record, &def.key_path).is_ok_and(|other| other == index_key)
        });
        if taken {
            return Err(EngineError::ConstraintError {
                index: name.clone(),
                key: index_key,
            });
        }
    }
    Ok(())
}
