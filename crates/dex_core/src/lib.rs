//! # Dex Core
//!
//! Queued, batched key/value access over an asynchronous storage engine.
//!
//! This crate provides:
//! - A connection lifecycle that opens (and upgrades) the database on demand
//! - Operations callable before the connection is open, queued and replayed
//!   in call order once it is
//! - Per-mode transaction reuse, so consecutive operations share a transaction
//! - Batches reporting ordered results, progress events and the first error
//! - Lifecycle events for connections, transactions and writes
//!
//! ## Example
//!
//! ```rust,ignore
//! use dex_core::{Config, Database};
//! use dex_engine::MemoryEngine;
//! use regex::Regex;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let db = Database::open(Arc::new(MemoryEngine::new()), Config::default());
//!
//! db.set("user:1", json!({ "name": "ann" })).await?;
//! let response = db.get("user:1").await?;
//! let keys = db.keys(Regex::new("^user:")?).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod config;
mod connection;
mod database;
mod dispatch;
mod error;
mod events;
mod item;
mod ops;
mod pool;

pub use batch::Batch;
pub use config::{Config, DEFAULT_NAME, KEY_PATH};
pub use connection::ConnectionState;
pub use database::Database;
pub use dispatch::{Outcome, Reply};
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus, EventKind, Subscription};
pub use item::{Item, RequestEvent, RequestKind, Response, StoredValue, ITEM_TYPE};
pub use ops::{AllKeys, KeyPattern};

pub use dex_engine::{TransactionMode, Value};
