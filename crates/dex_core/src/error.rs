//! Error types for dex core operations.

use dex_engine::EngineError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in dex core operations.
///
/// Errors are `Clone` so a batch can report an operation's failure both to
/// the caller and in its `progress` event.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// The engine rejected a request (data, constraint or schema errors).
    #[error("engine error: {0}")]
    Engine(#[source] EngineError),

    /// Opening the database failed.
    #[error("failed to connect to {name}: {message}")]
    Connection {
        /// Database name.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// Opening the database was blocked by another open connection.
    #[error("connection to {name} is blocked by another connection")]
    Blocked {
        /// Database name.
        name: String,
    },

    /// The transaction an operation ran in was aborted.
    #[error("transaction {id} aborted")]
    TransactionAborted {
        /// Engine transaction id.
        id: u64,
    },

    /// The database has no open connection.
    #[error("not connected")]
    NotConnected,

    /// A queued operation was dropped before it could run.
    #[error("operation cancelled")]
    Cancelled,

    /// A tagged item was stored under a key other than its own.
    #[error("item key {item_key} does not match key {key}")]
    KeyMismatch {
        /// Key the item was stored under.
        key: String,
        /// Key carried by the item.
        item_key: String,
    },

    /// A record could not be converted to or from JSON.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a connection error.
    pub fn connection(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the operation failed because its transaction ended.
    pub fn is_transaction_abort(&self) -> bool {
        matches!(self, Self::TransactionAborted { .. })
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::TransactionAborted { id } | EngineError::TransactionInactive { id } => {
                Self::TransactionAborted { id }
            }
            EngineError::Blocked { name, .. } => Self::Blocked { name },
            other => Self::Engine(other),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
