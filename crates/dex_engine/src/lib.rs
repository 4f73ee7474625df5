//! # Dex Engine
//!
//! Asynchronous storage engine interface for dex.
//!
//! This crate models the browser-style database dex runs on: databases are
//! opened by name and schema version, connections hand out transactions
//! scoped to object stores, and every operation is an asynchronous request.
//!
//! ## Design Principles
//!
//! - Requests are issued when the method is called, not when awaited
//! - Transactions commit on their own once they run out of requests
//! - A failed request aborts its transaction
//! - Records are JSON values keyed by a string at a key path
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - In-process engine for tests and ephemeral use
//!
//! ## Example
//!
//! ```rust
//! use dex_engine::{Engine, EngineConnection, MemoryEngine, SchemaUpgrade, TransactionMode};
//! use serde_json::json;
//!
//! # tokio_test_block(async {
//! let engine = MemoryEngine::new();
//! let conn = engine
//!     .open("db", 1, Box::new(|up: &mut dyn SchemaUpgrade| {
//!         up.create_object_store("items", "key")
//!     }))
//!     .await
//!     .unwrap();
//!
//! let txn = conn.transaction(&["items"], TransactionMode::ReadWrite).unwrap();
//! let store = txn.object_store("items").unwrap();
//! store.put(json!({ "key": "a", "value": 1 })).await.unwrap();
//! assert_eq!(store.get("a").await.unwrap(), Some(json!({ "key": "a", "value": 1 })));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod memory;

pub use engine::{
    extract_key, Engine, EngineConnection, EngineIndex, EngineObjectStore, EngineTransaction,
    KeyCursor, Request, SchemaUpgrade, TransactionEvent, TransactionListener, TransactionMode,
    UpgradeFn, Value,
};
pub use error::{EngineError, EngineResult};
pub use memory::{
    MemoryConnection, MemoryEngine, MemoryIndex, MemoryObjectStore, MemoryTransaction,
};
