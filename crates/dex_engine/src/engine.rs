//! Engine trait definitions.

use crate::error::{EngineError, EngineResult};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Values stored by the engine.
pub type Value = serde_json::Value;

/// An asynchronous engine request.
///
/// The request is issued when the method returning it is called; awaiting it
/// only observes the completion. Dropping it does not cancel the work.
pub type Request<T> = BoxFuture<'static, EngineResult<T>>;

/// Callback run inside a version-change upgrade.
pub type UpgradeFn = Box<dyn FnOnce(&mut dyn SchemaUpgrade) -> EngineResult<()> + Send>;

/// Listener for transaction lifecycle notifications.
pub type TransactionListener = Box<dyn Fn(&TransactionEvent) + Send + Sync>;

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionMode {
    /// Reads only; may run alongside other read-only transactions.
    ReadOnly,
    /// Reads and writes; serialized with overlapping transactions.
    ReadWrite,
}

impl TransactionMode {
    /// Returns the engine name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::ReadWrite => "readwrite",
        }
    }

    /// Returns true for read-only transactions.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification delivered to transaction listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// All requests finished and the writes are durable.
    Complete,
    /// The transaction was rolled back.
    Abort,
    /// A request failed; an `Abort` follows.
    Error(EngineError),
}

/// An asynchronous, connection-oriented key/value storage engine.
///
/// Engines are opened by database name and schema version. A connection hands
/// out transactions scoped to object stores; object stores issue requests
/// that complete asynchronously.
///
/// # Invariants
///
/// - `open` runs the upgrade callback only when `version` is newer than the
///   stored version, and applies its schema changes atomically
/// - An open that needs an upgrade while other connections are open fails
///   with [`EngineError::Blocked`]
/// - Requests of one transaction run in issue order
/// - A transaction commits once it has no outstanding requests
pub trait Engine: Send + Sync {
    /// Opens database `name` at schema `version`.
    ///
    /// # Errors
    ///
    /// The request fails with:
    /// - [`EngineError::Blocked`] if an upgrade is needed and other
    ///   connections are open
    /// - [`EngineError::VersionError`] if `version` is older than the stored one
    /// - any error returned by `upgrade`
    fn open(&self, name: &str, version: u32, upgrade: UpgradeFn)
        -> Request<Arc<dyn EngineConnection>>;

    /// Deletes database `name` and all its stores.
    ///
    /// # Errors
    ///
    /// The request fails with [`EngineError::Blocked`] while connections are open.
    fn delete_database(&self, name: &str) -> Request<()>;
}

/// Schema operations available during an upgrade.
pub trait SchemaUpgrade {
    /// Version before the upgrade (0 for a new database).
    fn old_version(&self) -> u32;

    /// Version being upgraded to.
    fn new_version(&self) -> u32;

    /// Returns true if the object store exists.
    fn has_object_store(&self, name: &str) -> bool;

    /// Creates an object store keyed by `key_path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StoreExists`] if the store already exists.
    fn create_object_store(&mut self, name: &str, key_path: &str) -> EngineResult<()>;

    /// Creates an index over `key_path` on `store`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StoreNotFound`] if `store` does not exist.
    fn create_index(
        &mut self,
        store: &str,
        name: &str,
        key_path: &str,
        unique: bool,
    ) -> EngineResult<()>;
}

/// An open connection to one database.
pub trait EngineConnection: Send + Sync {
    /// Database name.
    fn name(&self) -> &str;

    /// Schema version the connection was opened at.
    fn version(&self) -> u32;

    /// Names of the object stores in the database.
    fn object_store_names(&self) -> Vec<String>;

    /// Starts a transaction over `stores`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed, a store does not exist,
    /// or no runtime is available to drive the transaction.
    fn transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
    ) -> EngineResult<Arc<dyn EngineTransaction>>;

    /// Closes the connection. Running transactions finish normally.
    fn close(&self);

    /// Returns true once `close` was called.
    fn is_closed(&self) -> bool;
}

/// A unit of work scoped to a set of object stores.
pub trait EngineTransaction: Send + Sync {
    /// Engine-assigned transaction id.
    fn id(&self) -> u64;

    /// Access mode.
    fn mode(&self) -> TransactionMode;

    /// Returns true until the transaction commits or aborts.
    fn is_live(&self) -> bool;

    /// Returns a handle to an object store in the transaction's scope.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StoreNotFound`] for stores outside the scope.
    fn object_store(&self, name: &str) -> EngineResult<Arc<dyn EngineObjectStore>>;

    /// Registers a lifecycle listener.
    fn listen(&self, listener: TransactionListener);

    /// Aborts the transaction, discarding its writes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TransactionInactive`] if it already finished.
    fn abort(&self) -> EngineResult<()>;
}

/// A keyed record collection seen through a transaction.
pub trait EngineObjectStore: Send + Sync {
    /// Store name.
    fn name(&self) -> &str;

    /// Key path records are keyed by.
    fn key_path(&self) -> &str;

    /// Inserts or replaces a record; resolves to its primary key.
    fn put(&self, value: Value) -> Request<String>;

    /// Reads a record; resolves to `None` if absent.
    fn get(&self, key: &str) -> Request<Option<Value>>;

    /// Deletes a record. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Request<()>;

    /// Returns an index of this store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IndexNotFound`] if the index does not exist.
    fn index(&self, name: &str) -> EngineResult<Arc<dyn EngineIndex>>;

    /// Opens a cursor over primary keys in ascending order.
    fn open_key_cursor(&self) -> Request<Option<Box<dyn KeyCursor>>>;
}

/// A secondary lookup index over an object store.
pub trait EngineIndex: Send + Sync {
    /// Index name.
    fn name(&self) -> &str;

    /// Key path of the indexed field.
    fn key_path(&self) -> &str;

    /// Whether index keys must be unique.
    fn unique(&self) -> bool;

    /// Opens a cursor over index keys in ascending order.
    fn open_key_cursor(&self) -> Request<Option<Box<dyn KeyCursor>>>;
}

/// A step-at-a-time cursor over keys.
///
/// Each [`advance`](KeyCursor::advance) is a separate request; `None` marks
/// the end of iteration.
pub trait KeyCursor: Send {
    /// Key at the current position (index key for index cursors).
    fn key(&self) -> &str;

    /// Primary key of the record at the current position.
    fn primary_key(&self) -> &str;

    /// Moves to the next position.
    fn advance(self: Box<Self>) -> Request<Option<Box<dyn KeyCursor>>>;
}

/// Extracts a string key from `value` at a dotted `key_path`.
///
/// # Errors
///
/// Returns [`EngineError::DataError`] if the path is missing or does not
/// point at a string.
pub fn extract_key(value: &Value, key_path: &str) -> EngineResult<String> {
    let mut current = value;
    for segment in key_path.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| EngineError::data(format!("key path {key_path} not found")))?;
    }
    current
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| EngineError::data(format!("key path {key_path} is not a string")))
}
