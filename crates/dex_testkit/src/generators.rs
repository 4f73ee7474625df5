//! Property-based test generators using proptest.
//!
//! Provides strategies for generating keys, values and operation
//! sequences.

use dex_core::Item;
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for generating keys.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9:_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating keys from a small space, so operations collide.
pub fn narrow_key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "user:1", "user:2", "post:1"])
        .prop_map(String::from)
}

/// Strategy for generating JSON values, nested up to three levels.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// Strategy for generating tagged items.
pub fn item_strategy() -> impl Strategy<Value = Item> {
    (key_strategy(), value_strategy()).prop_map(|(key, value)| Item::new(key, value))
}

/// One database call.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Store a value
    Set {
        /// Key
        key: String,
        /// Value
        value: Value,
    },
    /// Read a key
    Get {
        /// Key
        key: String,
    },
    /// Delete a key
    Del {
        /// Key
        key: String,
    },
    /// Check a key
    Exists {
        /// Key
        key: String,
    },
}

impl Operation {
    /// The key this operation touches.
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Get { key } | Self::Del { key } | Self::Exists { key } => {
                key
            }
        }
    }
}

/// Strategy for generating operations over colliding keys.
pub fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => (narrow_key_strategy(), value_strategy())
            .prop_map(|(key, value)| Operation::Set { key, value }),
        1 => narrow_key_strategy().prop_map(|key| Operation::Del { key }),
        2 => narrow_key_strategy().prop_map(|key| Operation::Get { key }),
        1 => narrow_key_strategy().prop_map(|key| Operation::Exists { key }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec(operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 128,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 24,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
