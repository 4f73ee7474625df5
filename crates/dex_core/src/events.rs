//! Lifecycle events of a [`crate::Database`].
//!
//! Events are published synchronously: channel listeners receive them
//! first, then every handler subscribed to the event's kind is called in
//! subscription order. Handlers may call back into the database.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dex_core::{Database, EventKind};
//!
//! let db = Database::open(engine, Config::default());
//!
//! let subscription = db.on(EventKind::Connect, |event| {
//!     println!("{event:?}");
//! });
//!
//! // Or receive every event on a channel
//! let mut events = db.events().listen();
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

use crate::dispatch::Outcome;
use crate::error::CoreError;
use dex_engine::{TransactionMode, Value};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Kind of an [`Event`], used to subscribe handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A connection was opened.
    Connect,
    /// A connection was closed by `quit`.
    Quit,
    /// Opening was blocked by another connection.
    Blocked,
    /// Opening or a request failed.
    Error,
    /// A transaction committed.
    Complete,
    /// A transaction was rolled back.
    Abort,
    /// One operation of a batch finished.
    Progress,
    /// A value was written.
    Set,
    /// A key was deleted.
    Del,
}

impl EventKind {
    /// Returns the event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Quit => "quit",
            Self::Blocked => "blocked",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Abort => "abort",
            Self::Progress => "progress",
            Self::Set => "set",
            Self::Del => "del",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Connected to database `name`; queued calls were replayed.
    Connect {
        /// Database name.
        name: String,
    },
    /// The connection to `name` was closed.
    Quit {
        /// Database name.
        name: String,
    },
    /// Opening `name` was blocked by another open connection.
    Blocked {
        /// Database name.
        name: String,
    },
    /// An open or request failed.
    Error {
        /// Description of the failure.
        message: String,
    },
    /// A transaction committed.
    Complete {
        /// Engine transaction id.
        transaction: u64,
        /// Transaction mode.
        mode: TransactionMode,
    },
    /// A transaction was aborted.
    Abort {
        /// Engine transaction id.
        transaction: u64,
        /// Transaction mode.
        mode: TransactionMode,
    },
    /// Operation `index` of a batch finished.
    Progress {
        /// Position of the operation in the batch.
        index: usize,
        /// Result of the operation.
        outcome: Result<Outcome, CoreError>,
    },
    /// `value` was written under `key`.
    Set {
        /// Record key.
        key: String,
        /// Written value.
        value: Value,
    },
    /// `key` was deleted.
    Del {
        /// Record key.
        key: String,
    },
}

impl Event {
    /// Returns the kind of the event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connect { .. } => EventKind::Connect,
            Self::Quit { .. } => EventKind::Quit,
            Self::Blocked { .. } => EventKind::Blocked,
            Self::Error { .. } => EventKind::Error,
            Self::Complete { .. } => EventKind::Complete,
            Self::Abort { .. } => EventKind::Abort,
            Self::Progress { .. } => EventKind::Progress,
            Self::Set { .. } => EventKind::Set,
            Self::Del { .. } => EventKind::Del,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
}

impl Subscription {
    /// Kind of event the handler receives.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Distributes events to handlers and channel listeners.
///
/// The bus:
/// - Calls handlers outside of its locks, so handlers may publish
/// - Preserves publish order per listener
/// - Keeps a bounded history of recent events
pub struct EventBus {
    handlers: RwLock<Vec<(Subscription, Handler)>>,
    listeners: RwLock<Vec<UnboundedSender<Event>>>,
    history: RwLock<Vec<Event>>,
    max_history: usize,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates a new event bus.
    pub fn new() -> Self {
        Self::with_max_history(1024)
    }

    /// Creates an event bus with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers `handler` for events of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        self.handlers.write().push((subscription, Arc::new(handler)));
        subscription
    }

    /// Removes a handler. Returns false if it was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(s, _)| *s != subscription);
        handlers.len() != before
    }

    /// Returns a receiver of every event published from now on.
    pub fn listen(&self) -> UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.write().push(tx);
        rx
    }

    /// Publishes an event.
    pub fn publish(&self, event: Event) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let to_remove = history.len() - self.max_history;
                history.drain(0..to_remove);
            }
        }

        self.listeners
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());

        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .iter()
            .filter(|(s, _)| s.kind == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    /// Returns the retained events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.history.read().clone()
    }

    /// Returns the retained events of `kind`, oldest first.
    pub fn history_of(&self, kind: EventKind) -> Vec<Event> {
        self.history
            .read()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Returns the number of retained events.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Returns the number of subscribed handlers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns the number of channel listeners still open.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("listeners", &self.listener_count())
            .field("history", &self.history_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn connect(name: &str) -> Event {
        Event::Connect {
            name: name.to_string(),
        }
    }

    #[test]
    fn handlers_receive_their_kind_only() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::Connect, move |e| sink.lock().push(e.clone()));

        bus.publish(connect("a"));
        bus.publish(Event::Del { key: "k".into() });

        assert_eq!(*seen.lock(), vec![connect("a")]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let subscription = bus.subscribe(EventKind::Quit, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::Quit { name: "a".into() });
        assert!(bus.unsubscribe(subscription));
        assert!(!bus.unsubscribe(subscription));
        bus.publish(Event::Quit { name: "a".into() });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn handlers_may_publish() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe(EventKind::Connect, move |_| {
            inner.publish(Event::Quit { name: "a".into() });
        });

        bus.publish(connect("a"));

        let kinds: Vec<_> = bus.history().iter().map(Event::kind).collect();
        assert_eq!(kinds, vec![EventKind::Connect, EventKind::Quit]);
    }

    #[tokio::test]
    async fn listeners_receive_all_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.listen();

        bus.publish(connect("a"));
        bus.publish(Event::Del { key: "k".into() });

        assert_eq!(rx.recv().await, Some(connect("a")));
        assert_eq!(rx.recv().await, Some(Event::Del { key: "k".into() }));
    }

    #[test]
    fn closed_listeners_are_dropped() {
        let bus = EventBus::new();
        let rx = bus.listen();
        assert_eq!(bus.listener_count(), 1);

        drop(rx);
        bus.publish(connect("a"));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn history_truncation() {
        let bus = EventBus::with_max_history(3);
        for i in 0..10 {
            bus.publish(connect(&i.to_string()));
        }

        assert_eq!(bus.history_len(), 3);
        assert_eq!(bus.history()[0], connect("7"));
        assert_eq!(bus.history_of(EventKind::Connect).len(), 3);
        assert!(bus.history_of(EventKind::Quit).is_empty());
    }

    #[test]
    fn event_kind_names() {
        assert_eq!(EventKind::Progress.as_str(), "progress");
        assert_eq!(Event::Del { key: "k".into() }.kind().to_string(), "del");
    }
}
