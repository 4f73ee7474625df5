//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases over the
//! in-memory engine and common test scenarios.

use dex_core::{Config, Database};
use dex_engine::MemoryEngine;
use std::future::Future;
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

/// A test database together with the engine it runs on.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// The engine, kept for inspecting stored state.
    pub engine: MemoryEngine,
}

impl TestDatabase {
    /// Opens a database with the default configuration on a fresh engine.
    ///
    /// The connection is in flight; calls made now are queued.
    pub fn memory() -> Self {
        Self::with_config(Config::default())
    }

    /// Opens a database with `config` on a fresh engine.
    pub fn with_config(config: Config) -> Self {
        Self::on_engine(MemoryEngine::new(), config)
    }

    /// Opens a database with `config` on an existing engine.
    pub fn on_engine(engine: MemoryEngine, config: Config) -> Self {
        let db = Database::open(Arc::new(engine.clone()), config);
        Self { db, engine }
    }

    /// Creates a database that stays disconnected until `connect` is called.
    pub fn disconnected() -> Self {
        let engine = MemoryEngine::new();
        let db = Database::new(Arc::new(engine.clone()), Config::default());
        Self { db, engine }
    }

    /// Opens another database on the same engine.
    pub fn sibling(&self, config: Config) -> Self {
        Self::on_engine(self.engine.clone(), config)
    }

    /// Number of records in the configured store.
    pub fn record_count(&self) -> usize {
        let config = self.db.config();
        self.engine.record_count(&self.db.name(), &config.store_name)
    }

    /// Waits until no transaction is running against the database.
    pub async fn settle(&self) {
        let name = self.db.name();
        while self.engine.active_transactions(&name) > 0 {
            tokio::task::yield_now().await;
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test against a connected in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use dex_testkit::with_memory_db;
///
/// #[tokio::test]
/// async fn my_test() {
///     with_memory_db(|db| async move {
///         assert!(!db.exists("a").await.unwrap());
///     })
///     .await;
/// }
/// ```
pub async fn with_memory_db<F, Fut, R>(f: F) -> R
where
    F: FnOnce(Database) -> Fut,
    Fut: Future<Output = R>,
{
    let test_db = TestDatabase::memory();
    test_db.ready().await.expect("failed to open database");
    f(test_db.db.clone()).await
}

/// Installs a test-friendly tracing subscriber once per process.
///
/// Filtering follows `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use serde_json::json;

    /// Key used for the `index`-th record of a populated database.
    pub fn key_for(index: usize) -> String {
        format!("key:{index:04}")
    }

    /// Creates a connected database holding `count` records.
    pub async fn populated_database(count: usize) -> TestDatabase {
        let test_db = TestDatabase::memory();
        let mut batch = test_db.db.batch();
        for i in 0..count {
            batch = batch.set(key_for(i), json!({ "index": i }));
        }
        batch.end().await.expect("failed to populate database");
        test_db.settle().await;
        test_db
    }
}
