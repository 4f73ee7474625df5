//! Connection lifecycle.
//!
//! The manager owns the engine connection and the queue of calls made while
//! it was not open. State moves `Disconnected -> Connecting -> Connected`;
//! a failed or blocked open and `quit` move it back to `Disconnected`.

use crate::config::KEY_PATH;
use crate::dispatch::{Command, Outcome, PendingCall};
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::ops::Operations;
use dex_engine::{EngineConnection, EngineError, EngineResult, SchemaUpgrade, UpgradeFn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Connection state of a [`crate::Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no open in flight.
    Disconnected,
    /// An open is in flight.
    Connecting,
    /// A connection is open.
    Connected,
}

impl ConnectionState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a dispatched command goes.
pub(crate) enum Route {
    /// Connected: issue on this connection.
    Execute(Arc<dyn EngineConnection>, Command),
    /// Not connected: the result arrives once the queue is replayed.
    Queued(oneshot::Receiver<CoreResult<Outcome>>),
}

/// A database switch begun by [`ConnectionManager::select`].
pub(crate) struct Switch {
    /// Database whose connection the switch closed.
    pub(crate) closed: Option<String>,
    pub(crate) attempt: u64,
    pub(crate) name: String,
}

struct Link {
    name: String,
    state: ConnectionState,
    handle: Option<Arc<dyn EngineConnection>>,
    queue: VecDeque<PendingCall>,
    /// Bumped by every connect and quit; an open finishing under an older
    /// attempt is discarded.
    attempt: u64,
    last_error: Option<CoreError>,
}

/// Owns the connection, its state and the pending-call queue.
pub(crate) struct ConnectionManager {
    store_name: String,
    index_name: String,
    events: Arc<EventBus>,
    link: Mutex<Link>,
    status: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub(crate) fn new(
        name: impl Into<String>,
        store_name: impl Into<String>,
        index_name: impl Into<String>,
        events: Arc<EventBus>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            store_name: store_name.into(),
            index_name: index_name.into(),
            events,
            link: Mutex::new(Link {
                name: name.into(),
                state: ConnectionState::Disconnected,
                handle: None,
                queue: VecDeque::new(),
                attempt: 0,
                last_error: None,
            }),
            status,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    /// True iff a live connection handle exists.
    pub(crate) fn connected(&self) -> bool {
        self.link.lock().handle.is_some()
    }

    pub(crate) fn name(&self) -> String {
        self.link.lock().name.clone()
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.link.lock().queue.len()
    }

    /// Returns the live connection, or queues `command` behind the calls
    /// already waiting for one.
    pub(crate) fn route(&self, command: Command) -> Route {
        let mut link = self.link.lock();
        match &link.handle {
            Some(conn) => Route::Execute(Arc::clone(conn), command),
            None => {
                debug!(command = command.name(), queued = link.queue.len() + 1, "queued");
                let (deliver, rx) = oneshot::channel();
                link.queue.push_back(PendingCall { command, deliver });
                Route::Queued(rx)
            }
        }
    }

    /// Moves to `Connecting` unless already connecting or connected.
    ///
    /// Returns the attempt number and database name the caller must open.
    pub(crate) fn begin_connect(&self) -> Option<(u64, String)> {
        let mut link = self.link.lock();
        if link.state != ConnectionState::Disconnected {
            return None;
        }
        link.state = ConnectionState::Connecting;
        link.attempt += 1;
        link.last_error = None;
        self.status.send_replace(ConnectionState::Connecting);
        debug!(db = %link.name, attempt = link.attempt, "connecting");
        Some((link.attempt, link.name.clone()))
    }

    /// Switches to database `name`: closes the current connection, renames
    /// and begins connecting under one lock. `None` while an open is in
    /// flight.
    pub(crate) fn select(&self, name: &str) -> Option<Switch> {
        let (closed, handle, attempt) = {
            let mut link = self.link.lock();
            if link.state == ConnectionState::Connecting {
                return None;
            }
            let handle = link.handle.take();
            let closed = handle.as_ref().map(|_| link.name.clone());
            link.name = name.to_string();
            link.state = ConnectionState::Connecting;
            link.attempt += 1;
            link.last_error = None;
            (closed, handle, link.attempt)
        };
        if let Some(handle) = handle {
            handle.close();
        }
        if let Some(closed) = &closed {
            info!(db = %closed, "quit");
        }
        self.status.send_replace(ConnectionState::Connecting);
        debug!(db = %name, attempt, "connecting");
        Some(Switch {
            closed,
            attempt,
            name: name.to_string(),
        })
    }

    /// Schema upgrade run when the stored version is older than requested.
    pub(crate) fn upgrade(&self) -> UpgradeFn {
        let store = self.store_name.clone();
        let index = self.index_name.clone();
        Box::new(move |schema: &mut dyn SchemaUpgrade| {
            if schema.has_object_store(&store) {
                return Ok(());
            }
            debug!(store = %store, "add object store");
            schema.create_object_store(&store, KEY_PATH)?;
            schema.create_index(&store, &index, KEY_PATH, true)
        })
    }

    /// Completes attempt `attempt` with the engine's open result.
    ///
    /// On success the queue is replayed in submission order before the
    /// state lock is released, so no later call can overtake a queued one.
    pub(crate) fn finish_connect(
        &self,
        attempt: u64,
        result: EngineResult<Arc<dyn EngineConnection>>,
        ops: &Operations,
    ) {
        let mut link = self.link.lock();
        if link.attempt != attempt || link.state != ConnectionState::Connecting {
            drop(link);
            if let Ok(conn) = result {
                conn.close();
            }
            debug!(attempt, "discarded stale open");
            return;
        }

        let name = link.name.clone();
        match result {
            Ok(conn) => {
                link.handle = Some(Arc::clone(&conn));
                link.state = ConnectionState::Connected;
                let queued: Vec<PendingCall> = link.queue.drain(..).collect();
                let replayed = queued.len();
                for call in queued {
                    call.replay(ops, &conn);
                }
                drop(link);

                self.status.send_replace(ConnectionState::Connected);
                info!(db = %name, replayed, "connected to {name}");
                self.events.publish(Event::Connect { name });
            }
            Err(err) => {
                link.state = ConnectionState::Disconnected;
                let (error, event) = match err {
                    EngineError::Blocked { .. } => (
                        CoreError::Blocked { name: name.clone() },
                        Event::Blocked { name: name.clone() },
                    ),
                    other => {
                        let message = other.to_string();
                        (
                            CoreError::connection(name.clone(), message.clone()),
                            Event::Error { message },
                        )
                    }
                };
                link.last_error = Some(error);
                drop(link);

                self.status.send_replace(ConnectionState::Disconnected);
                warn!(db = %name, event = %event.kind(), "open failed");
                self.events.publish(event);
            }
        }
    }

    /// Closes the connection and returns the database name.
    ///
    /// Queued calls stay queued; an open in flight is discarded when it
    /// finishes.
    pub(crate) fn quit(&self) -> String {
        let (name, handle) = {
            let mut link = self.link.lock();
            link.attempt += 1;
            link.state = ConnectionState::Disconnected;
            link.last_error = None;
            (link.name.clone(), link.handle.take())
        };
        if let Some(handle) = handle {
            handle.close();
        }
        self.status.send_replace(ConnectionState::Disconnected);
        info!(db = %name, "quit");
        name
    }

    /// Waits until connected.
    ///
    /// # Errors
    ///
    /// Fails with the open's error if the attempt in flight fails, or with
    /// [`CoreError::NotConnected`] if no attempt is in flight.
    pub(crate) async fn ready(&self) -> CoreResult<()> {
        let mut status = self.status.subscribe();
        loop {
            let state = *status.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(self
                        .link
                        .lock()
                        .last_error
                        .clone()
                        .unwrap_or(CoreError::NotConnected));
                }
                ConnectionState::Connecting => {}
            }
            if status.changed().await.is_err() {
                return Err(CoreError::Cancelled);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let link = self.link.get_mut();
        if let Some(handle) = link.handle.take() {
            handle.close();
        }
        if !link.queue.is_empty() {
            debug!(dropped = link.queue.len(), "cancelled queued calls");
        }
    }
}
