//! The key/value operations.

use crate::dispatch::{Command, Outcome};
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::item::{RequestKind, Response, StoredValue};
use crate::pool::TransactionPool;
use dex_engine::{EngineConnection, TransactionMode, Value};
use futures::future::{self, BoxFuture};
use futures::{FutureExt, TryFutureExt};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Selects the keys returned by a key scan.
pub trait KeyPattern: Send + Sync {
    /// Returns true if `key` should be returned.
    fn matches(&self, key: &str) -> bool;

    /// Describes the pattern for logs.
    fn describe(&self) -> String {
        "<fn>".to_string()
    }
}

impl KeyPattern for Regex {
    fn matches(&self, key: &str) -> bool {
        self.is_match(key)
    }

    fn describe(&self) -> String {
        format!("/{}/", self.as_str())
    }
}

impl<F> KeyPattern for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn matches(&self, key: &str) -> bool {
        self(key)
    }
}

/// Pattern matching every key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllKeys;

impl KeyPattern for AllKeys {
    fn matches(&self, _key: &str) -> bool {
        true
    }

    fn describe(&self) -> String {
        "*".to_string()
    }
}

type Issued<T> = BoxFuture<'static, CoreResult<T>>;

/// Runs commands against an open connection through the transaction pool.
pub(crate) struct Operations {
    pub(crate) pool: TransactionPool,
    events: Arc<EventBus>,
    index_name: String,
    max_scan_keys: Option<usize>,
}

impl Operations {
    pub(crate) fn new(
        pool: TransactionPool,
        events: Arc<EventBus>,
        index_name: impl Into<String>,
        max_scan_keys: Option<usize>,
    ) -> Self {
        Self {
            pool,
            events,
            index_name: index_name.into(),
            max_scan_keys,
        }
    }

    /// Issues `command`. The first engine request is issued before this
    /// returns; the future finishes the operation (write events, cursor
    /// steps) and is driven by the dispatcher.
    pub(crate) fn execute(
        &self,
        conn: &Arc<dyn EngineConnection>,
        command: Command,
    ) -> Issued<Outcome> {
        let conn = conn.as_ref();
        let issued = match command {
            Command::Set { key, value } => self
                .set(conn, key, value)
                .map(|reply| reply.map_ok(Outcome::Response).boxed()),
            Command::Get { key } => self
                .get(conn, &key)
                .map(|reply| reply.map_ok(Outcome::Response).boxed()),
            Command::Del { key } => self
                .del(conn, key)
                .map(|reply| reply.map_ok(Outcome::Response).boxed()),
            Command::Exists { key } => self
                .exists(conn, &key)
                .map(|reply| reply.map_ok(Outcome::Exists).boxed()),
            Command::Keys { pattern } => self
                .keys(conn, pattern)
                .map(|reply| reply.map_ok(Outcome::Keys).boxed()),
        };
        issued.unwrap_or_else(rejected)
    }

    fn set(
        &self,
        conn: &dyn EngineConnection,
        key: String,
        value: StoredValue,
    ) -> CoreResult<Issued<Response>> {
        debug!(key = %key, "set");
        let item = value.into_item(&key)?;
        let target = self.pool.store(conn, TransactionMode::ReadWrite)?;
        let request = target.store.put(item.to_value()?);
        let event = target.event(RequestKind::Put);
        let events = Arc::clone(&self.events);

        Ok(async move {
            let key = request.await?;
            events.publish(Event::Set {
                key: key.clone(),
                value: item.value,
            });
            Ok(Response {
                item: Some(Value::String(key)),
                event,
            })
        }
        .boxed())
    }

    fn get(&self, conn: &dyn EngineConnection, key: &str) -> CoreResult<Issued<Response>> {
        debug!(key = %key, "get");
        let target = self.pool.store(conn, TransactionMode::ReadOnly)?;
        let request = target.store.get(key);
        let event = target.event(RequestKind::Get);

        Ok(async move {
            let item = request.await?;
            Ok(Response { item, event })
        }
        .boxed())
    }

    fn del(&self, conn: &dyn EngineConnection, key: String) -> CoreResult<Issued<Response>> {
        debug!(key = %key, "del");
        let target = self.pool.store(conn, TransactionMode::ReadWrite)?;
        let request = target.store.delete(&key);
        let event = target.event(RequestKind::Delete);
        let events = Arc::clone(&self.events);

        Ok(async move {
            request.await?;
            events.publish(Event::Del { key });
            Ok(Response { item: None, event })
        }
        .boxed())
    }

    fn exists(&self, conn: &dyn EngineConnection, key: &str) -> CoreResult<Issued<bool>> {
        debug!(key = %key, "exists");
        let reply = self.get(conn, key)?;
        Ok(async move { Ok(reply.await?.item.is_some()) }.boxed())
    }

    /// Walks the lookup index one cursor step at a time, collecting the
    /// keys `pattern` accepts in ascending order.
    fn keys(
        &self,
        conn: &dyn EngineConnection,
        pattern: Arc<dyn KeyPattern>,
    ) -> CoreResult<Issued<Vec<String>>> {
        debug!(pattern = %pattern.describe(), "keys");
        let target = self.pool.store(conn, TransactionMode::ReadOnly)?;
        let index = target.store.index(&self.index_name)?;
        let first = index.open_key_cursor();
        let limit = self.max_scan_keys;

        Ok(async move {
            let mut keys = Vec::new();
            let mut scanned = 0;
            let mut cursor = first.await?;
            while let Some(current) = cursor {
                if limit.is_some_and(|limit| scanned >= limit) {
                    debug!(scanned, "key scan limit reached");
                    break;
                }
                scanned += 1;
                if pattern.matches(current.key()) {
                    keys.push(current.key().to_string());
                }
                cursor = current.advance().await?;
            }
            Ok(keys)
        }
        .boxed())
    }
}

/// Fails the operation with `err` without touching the engine.
pub(crate) fn rejected<T: Send + 'static>(err: CoreError) -> Issued<T> {
    future::ready(Err(err)).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use dex_engine::{Engine, MemoryEngine, SchemaUpgrade};
    use serde_json::json;

    async fn setup(max_scan_keys: Option<usize>) -> (Arc<dyn EngineConnection>, Arc<EventBus>, Operations) {
        let engine = MemoryEngine::new();
        let conn = engine
            .open(
                "db",
                1,
                Box::new(|up: &mut dyn SchemaUpgrade| {
                    up.create_object_store("__dex__", "key")?;
                    up.create_index("__dex__", "key", "key", true)
                }),
            )
            .await
            .unwrap();
        let events = Arc::new(EventBus::new());
        let pool = TransactionPool::new("__dex__", Arc::clone(&events));
        let ops = Operations::new(pool, Arc::clone(&events), "key", max_scan_keys);
        (conn, events, ops)
    }

    fn set(key: &str, value: Value) -> Command {
        Command::Set {
            key: key.to_string(),
            value: value.into(),
        }
    }

    fn get(key: &str) -> Command {
        Command::Get {
            key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn set_then_get_returns_tagged_record() {
        let (conn, _events, ops) = setup(None).await;

        let outcome = ops.execute(&conn, set("a", json!({ "n": 1 }))).await.unwrap();
        assert_eq!(outcome.response().and_then(Response::key), Some("a"));

        let outcome = ops.execute(&conn, get("a")).await.unwrap();
        let record = outcome.response().unwrap().record().unwrap();
        assert_eq!(record, Some(Item::new("a", json!({ "n": 1 }))));
    }

    #[tokio::test]
    async fn get_missing_key_is_not_an_error() {
        let (conn, _events, ops) = setup(None).await;

        let outcome = ops.execute(&conn, get("missing")).await.unwrap();
        assert_eq!(outcome.response().unwrap().item, None);
    }

    #[tokio::test]
    async fn set_and_del_publish_events() {
        let (conn, events, ops) = setup(None).await;

        ops.execute(&conn, set("a", json!(1))).await.unwrap();
        ops.execute(&conn, Command::Del { key: "a".into() })
            .await
            .unwrap();

        assert_eq!(
            events.history_of(crate::EventKind::Set),
            vec![Event::Set {
                key: "a".into(),
                value: json!(1)
            }]
        );
        assert_eq!(
            events.history_of(crate::EventKind::Del),
            vec![Event::Del { key: "a".into() }]
        );
    }

    #[tokio::test]
    async fn exists_reflects_presence() {
        let (conn, _events, ops) = setup(None).await;
        let exists = |key: &str| Command::Exists {
            key: key.to_string(),
        };

        assert_eq!(
            ops.execute(&conn, exists("a")).await.unwrap(),
            Outcome::Exists(false)
        );
        ops.execute(&conn, set("a", json!(null))).await.unwrap();
        assert_eq!(
            ops.execute(&conn, exists("a")).await.unwrap(),
            Outcome::Exists(true)
        );
    }

    #[tokio::test]
    async fn key_mismatch_is_rejected_before_issuing() {
        let (conn, _events, ops) = setup(None).await;
        let command = Command::Set {
            key: "a".into(),
            value: Item::new("b", json!(1)).into(),
        };

        assert!(matches!(
            ops.execute(&conn, command).await,
            Err(CoreError::KeyMismatch { .. })
        ));
        assert_eq!(ops.pool.cached(TransactionMode::ReadWrite), None);
    }

    #[tokio::test]
    async fn keys_filters_and_sorts() {
        let (conn, _events, ops) = setup(None).await;
        for key in ["user:2", "post:1", "user:1"] {
            ops.execute(&conn, set(key, json!(key))).await.unwrap();
        }

        let command = Command::Keys {
            pattern: Arc::new(Regex::new("^user:").unwrap()),
        };
        let outcome = ops.execute(&conn, command).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Keys(vec!["user:1".to_string(), "user:2".to_string()])
        );

        let all = Command::Keys {
            pattern: Arc::new(AllKeys),
        };
        assert_eq!(
            ops.execute(&conn, all).await.unwrap(),
            Outcome::Keys(vec![
                "post:1".to_string(),
                "user:1".to_string(),
                "user:2".to_string()
            ])
        );
    }

    #[test]
    fn pattern_descriptions() {
        assert_eq!(Regex::new("^a").unwrap().describe(), "/^a/");
        assert_eq!(AllKeys.describe(), "*");
        assert!((|key: &str| key.is_empty()).matches(""));
    }

    #[tokio::test]
    async fn keys_accepts_closures() {
        let (conn, _events, ops) = setup(None).await;
        for key in ["a", "bb", "ccc"] {
            ops.execute(&conn, set(key, json!(1))).await.unwrap();
        }

        let command = Command::Keys {
            pattern: Arc::new(|key: &str| key.len() > 1),
        };
        assert_eq!(
            ops.execute(&conn, command).await.unwrap(),
            Outcome::Keys(vec!["bb".to_string(), "ccc".to_string()])
        );
    }

    #[tokio::test]
    async fn keys_stops_at_scan_limit() {
        let (conn, _events, ops) = setup(Some(2)).await;
        for key in ["a", "b", "c"] {
            ops.execute(&conn, set(key, json!(1))).await.unwrap();
        }

        let command = Command::Keys {
            pattern: Arc::new(AllKeys),
        };
        assert_eq!(
            ops.execute(&conn, command).await.unwrap(),
            Outcome::Keys(vec!["a".to_string(), "b".to_string()])
        );
    }
}
