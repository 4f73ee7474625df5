//! Model-checking harness.
//!
//! Runs calls against a database while tracking the expected contents in
//! an ordered map, and verifies each result against it.

use crate::fixtures::TestDatabase;
use crate::generators::Operation;
use dex_core::{AllKeys, Outcome};
use serde_json::Value;
use std::collections::BTreeMap;

/// A test harness for integration testing.
///
/// Must be created inside a Tokio runtime.
pub struct IntegrationHarness {
    /// The database under test.
    pub db: TestDatabase,
    /// Expected contents.
    expected: BTreeMap<String, Value>,
}

impl IntegrationHarness {
    /// Creates a harness over a fresh in-memory database.
    pub fn new() -> Self {
        Self {
            db: TestDatabase::memory(),
            expected: BTreeMap::new(),
        }
    }

    /// Stores a value and tracks it.
    pub async fn set(&mut self, key: &str, value: Value) {
        let response = self
            .db
            .set(key, value.clone())
            .await
            .expect("failed to set");
        assert_eq!(response.key(), Some(key));
        self.expected.insert(key.to_string(), value);
    }

    /// Reads a key and verifies it matches the tracked value.
    pub async fn get_and_verify(&self, key: &str) -> Option<Value> {
        let record = self
            .db
            .get(key)
            .await
            .expect("failed to get")
            .record()
            .expect("stored record is not an item");
        let actual = record.map(|item| {
            assert_eq!(item.key, key, "item key mismatch");
            item.value
        });
        assert_eq!(actual.as_ref(), self.expected.get(key), "value mismatch for {key}");
        actual
    }

    /// Checks a key and verifies it matches tracking.
    pub async fn exists_and_verify(&self, key: &str) -> bool {
        let found = self.db.exists(key).await.expect("failed to check key");
        assert_eq!(found, self.expected.contains_key(key), "exists mismatch for {key}");
        found
    }

    /// Deletes a key and updates tracking.
    pub async fn del(&mut self, key: &str) {
        self.db.del(key).await.expect("failed to delete");
        self.expected.remove(key);
    }

    /// Applies one operation, verifying reads.
    pub async fn apply(&mut self, op: &Operation) {
        match op {
            Operation::Set { key, value } => self.set(key, value.clone()).await,
            Operation::Get { key } => {
                self.get_and_verify(key).await;
            }
            Operation::Del { key } => self.del(key).await,
            Operation::Exists { key } => {
                self.exists_and_verify(key).await;
            }
        }
    }

    /// Applies the writes among `ops` as one batch.
    ///
    /// Reads are skipped: within a batch they may observe later writes of
    /// the shared write transaction.
    pub async fn apply_writes(&mut self, ops: &[Operation]) -> Vec<Outcome> {
        let mut batch = self.db.batch();
        let mut keys = Vec::new();
        for op in ops {
            batch = match op {
                Operation::Set { key, value } => batch.set(key.as_str(), value.clone()),
                Operation::Del { key } => batch.del(key.as_str()),
                Operation::Get { .. } | Operation::Exists { .. } => continue,
            };
            keys.push(op.key().to_string());
        }
        let outcomes = batch.end().await.expect("batch failed");

        assert_eq!(outcomes.len(), keys.len());
        for op in ops {
            match op {
                Operation::Set { key, value } => {
                    self.expected.insert(key.clone(), value.clone());
                }
                Operation::Del { key } => {
                    self.expected.remove(key);
                }
                Operation::Get { .. } | Operation::Exists { .. } => {}
            }
        }
        outcomes
    }

    /// Verifies every tracked key is stored and nothing else is.
    pub async fn verify_all(&self) {
        let keys = self.db.keys(AllKeys).await.expect("failed to list keys");
        let expected: Vec<&String> = self.expected.keys().collect();
        assert_eq!(keys.iter().collect::<Vec<_>>(), expected, "key set mismatch");

        for key in self.expected.keys() {
            self.get_and_verify(key).await;
        }
    }

    /// Returns the count of tracked keys.
    pub fn tracked_count(&self) -> usize {
        self.expected.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::{operation_sequence_strategy, PropTestConfig};
    use proptest::prelude::*;
    use serde_json::json;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[tokio::test]
    async fn test_harness_basic() {
        let mut harness = IntegrationHarness::new();

        harness.set("a", json!({ "n": 1 })).await;
        harness.set("b", json!(null)).await;
        assert_eq!(harness.get_and_verify("a").await, Some(json!({ "n": 1 })));
        assert_eq!(harness.get_and_verify("b").await, Some(json!(null)));

        harness.del("a").await;
        assert!(!harness.exists_and_verify("a").await);
        assert_eq!(harness.tracked_count(), 1);

        harness.verify_all().await;
    }

    #[tokio::test]
    async fn test_batch_writes() {
        let mut harness = IntegrationHarness::new();
        let ops = vec![
            Operation::Set { key: "x".into(), value: json!(1) },
            Operation::Get { key: "x".into() },
            Operation::Set { key: "y".into(), value: json!(2) },
            Operation::Del { key: "x".into() },
        ];

        let outcomes = harness.apply_writes(&ops).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes[0].response().and_then(|r| r.key()),
            Some("x")
        );

        harness.verify_all().await;
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn sequential_calls_match_model(ops in operation_sequence_strategy(1, 24)) {
            block_on(async {
                let mut harness = IntegrationHarness::new();
                for op in &ops {
                    harness.apply(op).await;
                }
                harness.verify_all().await;
            });
        }

        #[test]
        fn batched_writes_match_model(ops in operation_sequence_strategy(1, 24)) {
            block_on(async {
                let mut harness = IntegrationHarness::new();
                harness.apply_writes(&ops).await;
                harness.verify_all().await;
            });
        }
    }
}
