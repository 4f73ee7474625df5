//! # Dex Testkit
//!
//! Test utilities for dex.
//!
//! This crate provides:
//! - Test fixtures over the in-memory engine
//! - Property-based test generators using proptest
//! - A model-checking harness comparing a database against a map
//! - Concurrent load helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dex_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_database() {
//!     with_memory_db(|db| async move {
//!         db.set("a", serde_json::json!(1)).await.unwrap();
//!     })
//!     .await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
