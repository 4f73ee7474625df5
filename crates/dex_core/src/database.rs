//! Database facade.

use crate::batch::{self, Batch};
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatch::{self, Command, Outcome, Reply};
use crate::error::CoreResult;
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::item::{Response, StoredValue};
use crate::ops::{KeyPattern, Operations};
use crate::pool::TransactionPool;
use dex_engine::{Engine, EngineError, TransactionMode};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// The main database handle.
///
/// `Database` is the entry point of dex. It provides:
/// - Key/value operations that can be called before the connection is open
/// - Batches that run several operations as one unit
/// - Lifecycle events
///
/// Operations return a [`Reply`] immediately. While the database is not
/// connected the call is queued, and the queue is replayed in call order as
/// soon as the connection opens.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use dex_core::{Config, Database};
/// use dex_engine::MemoryEngine;
/// use serde_json::json;
///
/// let db = Database::open(Arc::new(MemoryEngine::new()), Config::default());
///
/// // Queued until the connection opens
/// let reply = db.set("user:1", json!({ "name": "ann" }));
///
/// reply.await?;
/// assert!(db.exists("user:1").await?);
/// ```
///
/// # Batches
///
/// ```rust,ignore
/// let outcomes = db
///     .batch()
///     .set("a", json!(1))
///     .set("b", json!(2))
///     .get("a")
///     .end()
///     .await?;
/// assert_eq!(outcomes.len(), 3);
/// ```
///
/// Cloning a `Database` yields another handle to the same connection, queue
/// and batch. The connection is closed when the last handle is dropped;
/// calls still queued at that point fail with [`crate::CoreError::Cancelled`].
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    engine: Arc<dyn Engine>,
    events: Arc<EventBus>,
    connection: ConnectionManager,
    ops: Operations,
    batch: Mutex<Vec<Command>>,
}

impl Database {
    /// Creates a disconnected database over `engine`.
    ///
    /// Operations are queued until [`connect`](Self::connect) or
    /// [`select`](Self::select) opens a connection.
    pub fn new(engine: Arc<dyn Engine>, config: Config) -> Self {
        let events = Arc::new(EventBus::with_max_history(config.event_history));
        let connection = ConnectionManager::new(
            config.name.clone(),
            config.store_name.clone(),
            config.index_name.clone(),
            Arc::clone(&events),
        );
        let pool = TransactionPool::new(config.store_name.clone(), Arc::clone(&events));
        let ops = Operations::new(
            pool,
            Arc::clone(&events),
            config.index_name.clone(),
            config.max_scan_keys,
        );

        Self {
            shared: Arc::new(Shared {
                config,
                engine,
                events,
                connection,
                ops,
                batch: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a database over `engine` and starts connecting.
    ///
    /// Must be called within a Tokio runtime; otherwise the open fails and
    /// an `error` event is published.
    pub fn open(engine: Arc<dyn Engine>, config: Config) -> Self {
        let db = Self::new(engine, config);
        db.connect();
        db
    }

    /// Starts opening the configured database.
    ///
    /// Does nothing when already connected or connecting. The open runs on
    /// the current Tokio runtime; when it succeeds the queued calls are
    /// replayed and `connect` is published.
    pub fn connect(&self) {
        if let Some((attempt, name)) = self.shared.connection.begin_connect() {
            self.open_attempt(attempt, name);
        }
    }

    fn open_attempt(&self, attempt: u64, name: String) {
        let request = self.shared.engine.open(
            &name,
            self.shared.config.schema_version,
            self.shared.connection.upgrade(),
        );
        let weak = Arc::downgrade(&self.shared);
        let task = async move {
            let result = request.await;
            match weak.upgrade() {
                Some(shared) => shared.connection.finish_connect(attempt, result, &shared.ops),
                None => {
                    if let Ok(conn) = result {
                        conn.close();
                    }
                }
            }
        };

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(task);
            }
            Err(_) => {
                self.shared
                    .connection
                    .finish_connect(attempt, Err(EngineError::NoRuntime), &self.shared.ops);
            }
        }
    }

    /// Switches to database `name`.
    ///
    /// A current connection is closed first (publishing `quit`). Ignored
    /// while a connect attempt is in flight.
    pub fn select(&self, name: &str) {
        let Some(switch) = self.shared.connection.select(name) else {
            debug!(db = %name, "select ignored while connecting");
            return;
        };
        if let Some(closed) = switch.closed {
            self.shared.ops.pool.clear();
            self.shared.events.publish(Event::Quit { name: closed });
        }
        self.open_attempt(switch.attempt, switch.name);
    }

    /// Closes the connection and forgets cached transactions.
    ///
    /// Publishes `quit` even when no connection was open.
    pub fn quit(&self) {
        let name = self.shared.connection.quit();
        self.shared.ops.pool.clear();
        self.shared.events.publish(Event::Quit { name });
    }

    /// Returns true iff a connection is open.
    pub fn connected(&self) -> bool {
        self.shared.connection.connected()
    }

    /// Returns the connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    /// Name of the selected database.
    pub fn name(&self) -> String {
        self.shared.connection.name()
    }

    /// Waits until the connection is open.
    ///
    /// # Errors
    ///
    /// Returns the open's error if the attempt in flight fails, or
    /// [`crate::CoreError::NotConnected`] if no attempt is in flight.
    pub async fn ready(&self) -> CoreResult<()> {
        self.shared.connection.ready().await
    }

    /// Number of calls waiting for the connection.
    pub fn queue_len(&self) -> usize {
        self.shared.connection.queue_len()
    }

    /// Stores `value` under `key`.
    ///
    /// Plain values are wrapped into a tagged [`crate::Item`]; tagged items
    /// are stored as-is. Resolves to a [`Response`] whose item is the key.
    pub fn set(&self, key: impl Into<String>, value: impl Into<StoredValue>) -> Reply<Response> {
        Reply::typed(self.dispatch(Command::Set {
            key: key.into(),
            value: value.into(),
        }))
    }

    /// Reads the record stored under `key`.
    ///
    /// A missing key resolves to a [`Response`] without item.
    pub fn get(&self, key: impl Into<String>) -> Reply<Response> {
        Reply::typed(self.dispatch(Command::Get { key: key.into() }))
    }

    /// Deletes `key`. Deleting a missing key succeeds.
    pub fn del(&self, key: impl Into<String>) -> Reply<Response> {
        Reply::typed(self.dispatch(Command::Del { key: key.into() }))
    }

    /// Checks whether a record is stored under `key`.
    pub fn exists(&self, key: impl Into<String>) -> Reply<bool> {
        Reply::typed(self.dispatch(Command::Exists { key: key.into() }))
    }

    /// Lists stored keys accepted by `pattern`, in ascending order.
    ///
    /// Visits at most [`Config::max_scan_keys`] keys when set.
    pub fn keys(&self, pattern: impl KeyPattern + 'static) -> Reply<Vec<String>> {
        Reply::typed(self.dispatch(Command::Keys {
            pattern: Arc::new(pattern),
        }))
    }

    /// Returns a handle appending to the current batch.
    pub fn batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    /// Number of commands in the current batch.
    pub fn batch_len(&self) -> usize {
        self.shared.batch.lock().len()
    }

    /// Runs the current batch and starts a new, empty one.
    ///
    /// Every command is dispatched in submission order. Resolves to the
    /// outcomes in submission order, or to the first error.
    pub fn end(&self) -> Reply<Vec<Outcome>> {
        let commands = std::mem::take(&mut *self.shared.batch.lock());
        debug!(commands = commands.len(), "end batch");
        let replies: Vec<_> = commands
            .into_iter()
            .map(|command| self.dispatch(command))
            .collect();
        Reply::new(batch::collect(replies, Arc::clone(&self.shared.events)))
    }

    /// Aborts the cached transaction for `mode`.
    ///
    /// Operations still running in it fail with
    /// [`crate::CoreError::TransactionAborted`]. Returns false if no live
    /// transaction was cached.
    pub fn abort(&self, mode: TransactionMode) -> bool {
        self.shared.ops.pool.abort(mode)
    }

    /// Id of the cached live transaction for `mode`.
    pub fn active_transaction(&self, mode: TransactionMode) -> Option<u64> {
        self.shared.ops.pool.cached(mode)
    }

    /// Registers `handler` for events of `kind`.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.events.subscribe(kind, handler)
    }

    /// Removes a handler registered with [`on`](Self::on).
    pub fn off(&self, subscription: Subscription) -> bool {
        self.shared.events.unsubscribe(subscription)
    }

    /// Returns the event bus.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Returns the database configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub(crate) fn push_batch(&self, command: Command) {
        self.shared.batch.lock().push(command);
    }

    fn dispatch(&self, command: Command) -> BoxFuture<'static, CoreResult<Outcome>> {
        dispatch::dispatch(&self.shared.connection, &self.shared.ops, command)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("queued", &self.queue_len())
            .field("batch", &self.batch_len())
            .finish()
    }
}
