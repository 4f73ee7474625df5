//! Property tests of the key/value operations over the in-memory engine.

use dex_core::{Config, Database};
use dex_engine::MemoryEngine;
use proptest::prelude::*;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn open() -> Database {
    Database::open(Arc::new(MemoryEngine::new()), Config::default())
}

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,12}".prop_map(Value::from),
        prop::collection::vec(any::<i32>(), 0..4).prop_map(|v| json!(v)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn set_then_get_returns_the_value(key in "[a-z:]{1,10}", value in value()) {
        let record = block_on(async {
            let db = open();
            db.set(key.as_str(), value.clone()).await.unwrap();
            db.get(key.as_str()).await.unwrap().record().unwrap()
        });

        let record = record.expect("record should exist");
        prop_assert_eq!(record.key, key);
        prop_assert_eq!(record.value, value);
    }

    #[test]
    fn del_then_exists_is_false(keys in prop::collection::vec("[a-z]{1,6}", 1..8)) {
        let (before, after) = block_on(async {
            let db = open();
            for key in &keys {
                db.set(key.as_str(), json!(true)).await.unwrap();
            }
            let before = db.exists(keys[0].as_str()).await.unwrap();
            db.del(keys[0].as_str()).await.unwrap();
            (before, db.exists(keys[0].as_str()).await.unwrap())
        });

        prop_assert!(before);
        prop_assert!(!after);
    }

    #[test]
    fn keys_returns_exactly_the_matching_keys(
        keys in prop::collection::vec("(user|post):[a-z0-9]{1,4}", 0..16),
    ) {
        let scanned = block_on(async {
            let db = open();
            for key in &keys {
                db.set(key.as_str(), json!(key)).await.unwrap();
            }
            db.keys(Regex::new("^user:").unwrap()).await.unwrap()
        });

        let expected: Vec<String> = keys
            .into_iter()
            .filter(|key| key.starts_with("user:"))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        prop_assert_eq!(scanned, expected);
    }
}
