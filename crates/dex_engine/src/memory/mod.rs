//! In-memory engine for testing.
//!
//! Emulates the scheduling rules of a browser-style asynchronous database:
//!
//! - every request runs on a spawned Tokio task, so it makes progress even
//!   when nobody polls its [`Request`]
//! - requests of one transaction run in issue order
//! - a transaction commits once it has no outstanding requests and no new
//!   request was issued before the next scheduler turn
//! - read-write transactions with overlapping scope run in creation order;
//!   read-only transactions only wait for older read-write ones
//!
//! All engine methods that create transactions or requests must be called
//! from within a Tokio runtime.

mod store;
mod transaction;

use crate::engine::{
    Engine, EngineConnection, EngineTransaction, Request, SchemaUpgrade, TransactionMode,
    UpgradeFn, Value,
};
use crate::error::{EngineError, EngineResult};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use transaction::TxnShared;

pub use store::{MemoryIndex, MemoryObjectStore};
pub use transaction::MemoryTransaction;

/// An in-memory [`Engine`].
///
/// Cloning the engine yields another handle to the same databases, so
/// several clients can share one engine the way they would share a browser
/// profile.
///
/// # Example
///
/// ```rust
/// use dex_engine::{Engine, EngineConnection, MemoryEngine, SchemaUpgrade};
///
/// # tokio_test_block(async {
/// let engine = MemoryEngine::new();
/// let conn = engine
///     .open("db", 1, Box::new(|up: &mut dyn SchemaUpgrade| {
///         up.create_object_store("items", "key")
///     }))
///     .await
///     .unwrap();
/// assert_eq!(conn.object_store_names(), vec!["items".to_string()]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

impl MemoryEngine {
    /// Creates an engine with no databases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored schema version of `name`, if the database exists.
    #[must_use]
    pub fn version(&self, name: &str) -> Option<u32> {
        self.shared.state.lock().databases.get(name).map(|db| db.version)
    }

    /// Returns the number of open connections to `name`.
    #[must_use]
    pub fn open_connections(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .databases
            .get(name)
            .map_or(0, |db| db.connections.len())
    }

    /// Returns the number of committed records in `store` of database `name`.
    #[must_use]
    pub fn record_count(&self, name: &str, store: &str) -> usize {
        self.shared
            .state
            .lock()
            .databases
            .get(name)
            .and_then(|db| db.stores.get(store))
            .map_or(0, |s| s.records.len())
    }

    /// Returns the number of transactions still running against `name`.
    #[must_use]
    pub fn active_transactions(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .databases
            .get(name)
            .map_or(0, |db| db.active.len())
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryEngine")
            .field("databases", &state.databases.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Engine for MemoryEngine {
    fn open(
        &self,
        name: &str,
        version: u32,
        upgrade: UpgradeFn,
    ) -> Request<Arc<dyn EngineConnection>> {
        let shared = Arc::clone(&self.shared);
        let name = name.to_string();

        async move {
            // Opening never completes in the caller's turn.
            tokio::task::yield_now().await;

            if version == 0 {
                return Err(EngineError::data("version must be at least 1"));
            }

            let id = shared.next_id();
            let mut state = shared.state.lock();
            let db = state
                .databases
                .entry(name.clone())
                .or_insert_with(DatabaseState::default);

            if version < db.version {
                return Err(EngineError::VersionError {
                    requested: version,
                    existing: db.version,
                });
            }

            if version > db.version {
                if !db.connections.is_empty() {
                    return Err(EngineError::Blocked {
                        name,
                        open_connections: db.connections.len(),
                    });
                }

                debug!(db = %name, from = db.version, to = version, "upgrade needed");
                let mut schema = MemoryUpgrade {
                    old_version: db.version,
                    new_version: version,
                    stores: db.stores.clone(),
                };
                if let Err(err) = upgrade(&mut schema) {
                    if db.version == 0 && db.stores.is_empty() {
                        state.databases.remove(&name);
                    }
                    return Err(err);
                }
                db.stores = schema.stores;
                db.version = version;
            }

            db.connections.insert(id);
            let connection = MemoryConnection {
                id,
                name,
                version: db.version,
                shared: Arc::clone(&shared),
                closed: AtomicBool::new(false),
            };
            Ok(Arc::new(connection) as Arc<dyn EngineConnection>)
        }
        .boxed()
    }

    fn delete_database(&self, name: &str) -> Request<()> {
        let shared = Arc::clone(&self.shared);
        let name = name.to_string();

        async move {
            tokio::task::yield_now().await;
            let mut state = shared.state.lock();
            if let Some(db) = state.databases.get(&name) {
                if !db.connections.is_empty() {
                    return Err(EngineError::Blocked {
                        open_connections: db.connections.len(),
                        name,
                    });
                }
            }
            state.databases.remove(&name);
            Ok(())
        }
        .boxed()
    }
}

/// State shared by every handle of one engine.
#[derive(Default)]
pub(crate) struct EngineShared {
    pub(crate) state: Mutex<EngineState>,
    /// Signalled whenever a transaction finishes.
    pub(crate) finished: Notify,
    next_id: AtomicU64,
}

impl EngineShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) databases: HashMap<String, DatabaseState>,
}

#[derive(Default)]
pub(crate) struct DatabaseState {
    pub(crate) version: u32,
    pub(crate) stores: BTreeMap<String, StoreState>,
    pub(crate) connections: BTreeSet<u64>,
    /// Running transactions by id (ids grow with creation order).
    pub(crate) active: BTreeMap<u64, ActiveTransaction>,
}

#[derive(Clone)]
pub(crate) struct StoreState {
    pub(crate) key_path: String,
    pub(crate) records: BTreeMap<String, Value>,
    pub(crate) indexes: BTreeMap<String, IndexDef>,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexDef {
    pub(crate) key_path: String,
    pub(crate) unique: bool,
}

pub(crate) struct ActiveTransaction {
    pub(crate) mode: TransactionMode,
    pub(crate) scope: Vec<String>,
}

/// Schema changes staged during an upgrade.
struct MemoryUpgrade {
    old_version: u32,
    new_version: u32,
    stores: BTreeMap<String, StoreState>,
}

impl SchemaUpgrade for MemoryUpgrade {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn has_object_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    fn create_object_store(&mut self, name: &str, key_path: &str) -> EngineResult<()> {
        if self.stores.contains_key(name) {
            return Err(EngineError::StoreExists {
                name: name.to_string(),
            });
        }
        self.stores.insert(
            name.to_string(),
            StoreState {
                key_path: key_path.to_string(),
                records: BTreeMap::new(),
                indexes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn create_index(
        &mut self,
        store: &str,
        name: &str,
        key_path: &str,
        unique: bool,
    ) -> EngineResult<()> {
        let store = self
            .stores
            .get_mut(store)
            .ok_or_else(|| EngineError::store_not_found(store))?;
        store.indexes.insert(
            name.to_string(),
            IndexDef {
                key_path: key_path.to_string(),
                unique,
            },
        );
        Ok(())
    }
}

/// A connection to a database in a [`MemoryEngine`].
pub struct MemoryConnection {
    id: u64,
    name: String,
    version: u32,
    shared: Arc<EngineShared>,
    closed: AtomicBool,
}

impl EngineConnection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn object_store_names(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .databases
            .get(&self.name)
            .map(|db| db.stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
    ) -> EngineResult<Arc<dyn EngineTransaction>> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed {
                name: self.name.clone(),
            });
        }

        let id = self.shared.next_id();
        let scope: Vec<String> = stores.iter().map(|s| (*s).to_string()).collect();
        {
            let mut state = self.shared.state.lock();
            let db = state
                .databases
                .get_mut(&self.name)
                .ok_or_else(|| EngineError::ConnectionClosed {
                    name: self.name.clone(),
                })?;
            if let Some(missing) = scope.iter().find(|s| !db.stores.contains_key(*s)) {
                return Err(EngineError::store_not_found(missing.clone()));
            }
            db.active.insert(
                id,
                ActiveTransaction {
                    mode,
                    scope: scope.clone(),
                },
            );
        }

        match TxnShared::begin(id, mode, self.name.clone(), scope, Arc::clone(&self.shared)) {
            Ok(txn) => Ok(Arc::new(MemoryTransaction::new(txn))),
            Err(err) => {
                if let Some(db) = self.shared.state.lock().databases.get_mut(&self.name) {
                    db.active.remove(&id);
                }
                Err(err)
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(db) = self.shared.state.lock().databases.get_mut(&self.name) {
            db.connections.remove(&self.id);
        }
        debug!(db = %self.name, connection = self.id, "connection closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}
