//! Error types for engine operations.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while talking to a storage engine.
///
/// Errors are `Clone` because a single failure is reported both to the
/// request that caused it and to the listeners of its transaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// An open (or delete) could not proceed because other connections are open.
    #[error("database {name} is blocked by {open_connections} open connection(s)")]
    Blocked {
        /// The database being opened.
        name: String,
        /// Number of connections still open.
        open_connections: usize,
    },

    /// The requested schema version is older than the stored one.
    #[error("requested version {requested} is lower than existing version {existing}")]
    VersionError {
        /// Version passed to `open`.
        requested: u32,
        /// Version already stored.
        existing: u32,
    },

    /// The named object store does not exist.
    #[error("object store not found: {name}")]
    StoreNotFound {
        /// Name of the object store.
        name: String,
    },

    /// An object store with this name already exists.
    #[error("object store already exists: {name}")]
    StoreExists {
        /// Name of the object store.
        name: String,
    },

    /// The named index does not exist.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Name of the index.
        name: String,
    },

    /// A unique index already holds this key for another record.
    #[error("constraint violated on index {index} for key {key}")]
    ConstraintError {
        /// Index whose constraint failed.
        index: String,
        /// Offending index key.
        key: String,
    },

    /// The record could not be keyed (missing or non-string key path).
    #[error("data error: {0}")]
    DataError(String),

    /// The transaction already finished.
    #[error("transaction {id} is not active")]
    TransactionInactive {
        /// Transaction id.
        id: u64,
    },

    /// The transaction was aborted before the request completed.
    #[error("transaction {id} aborted")]
    TransactionAborted {
        /// Transaction id.
        id: u64,
    },

    /// A write was attempted in a read-only transaction.
    #[error("transaction {id} is read-only")]
    ReadOnly {
        /// Transaction id.
        id: u64,
    },

    /// The connection was closed.
    #[error("connection to {name} is closed")]
    ConnectionClosed {
        /// Database name.
        name: String,
    },

    /// No Tokio runtime is available to drive requests.
    #[error("no async runtime available")]
    NoRuntime,
}

impl EngineError {
    /// Creates a data error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::DataError(message.into())
    }

    /// Creates a store-not-found error.
    pub fn store_not_found(name: impl Into<String>) -> Self {
        Self::StoreNotFound { name: name.into() }
    }

    /// Returns true if the error reports the end of a transaction rather than
    /// a failure of the request itself.
    pub fn is_transaction_end(&self) -> bool {
        matches!(
            self,
            Self::TransactionAborted { .. } | Self::TransactionInactive { .. }
        )
    }
}
