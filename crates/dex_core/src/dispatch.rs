//! Queue-or-execute dispatch of operations.
//!
//! Every public operation becomes a [`Command`]. While the database is not
//! connected the command is queued as a [`PendingCall`] and replayed once
//! the connection opens; otherwise it is issued against the engine at once.

use crate::connection::{ConnectionManager, Route};
use crate::error::{CoreError, CoreResult};
use crate::item::{Response, StoredValue};
use crate::ops::{KeyPattern, Operations};
use dex_engine::{EngineConnection, EngineError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// A deferred operation and its arguments.
#[derive(Clone)]
pub(crate) enum Command {
    Set { key: String, value: StoredValue },
    Get { key: String },
    Del { key: String },
    Exists { key: String },
    Keys { pattern: Arc<dyn KeyPattern> },
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Get { .. } => "get",
            Self::Del { .. } => "del",
            Self::Exists { .. } => "exists",
            Self::Keys { .. } => "keys",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set { key, value } => f
                .debug_struct("Set")
                .field("key", key)
                .field("value", value)
                .finish(),
            Self::Get { key } | Self::Del { key } | Self::Exists { key } => f
                .debug_struct(self.name())
                .field("key", key)
                .finish(),
            Self::Keys { pattern } => f
                .debug_struct("Keys")
                .field("pattern", &pattern.describe())
                .finish(),
        }
    }
}

/// A command queued until the connection opens.
pub(crate) struct PendingCall {
    pub(crate) command: Command,
    pub(crate) deliver: oneshot::Sender<CoreResult<Outcome>>,
}

impl PendingCall {
    /// Issues the command and forwards its result to the waiting caller.
    pub(crate) fn replay(self, ops: &Operations, conn: &Arc<dyn EngineConnection>) {
        let issued = ops.execute(conn, self.command);
        match Handle::try_current() {
            Ok(runtime) => drive(&runtime, issued, self.deliver),
            Err(_) => {
                let _ = self.deliver.send(Err(EngineError::NoRuntime.into()));
            }
        }
    }
}

/// Runs an issued operation to completion on its own task, so its events
/// and cursor steps do not wait for the caller to poll the reply.
fn drive(
    runtime: &Handle,
    issued: BoxFuture<'static, CoreResult<Outcome>>,
    deliver: oneshot::Sender<CoreResult<Outcome>>,
) {
    runtime.spawn(async move {
        let _ = deliver.send(issued.await);
    });
}

fn receive(rx: oneshot::Receiver<CoreResult<Outcome>>) -> BoxFuture<'static, CoreResult<Outcome>> {
    async move { rx.await.unwrap_or(Err(CoreError::Cancelled)) }.boxed()
}

/// Result of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Result of `set`, `get` or `del`.
    Response(Response),
    /// Result of `exists`.
    Exists(bool),
    /// Result of `keys`.
    Keys(Vec<String>),
}

impl Outcome {
    /// Returns the response of a `set`, `get` or `del`.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }

    /// Returns the answer of an `exists`.
    pub fn exists(&self) -> Option<bool> {
        match self {
            Self::Exists(found) => Some(*found),
            _ => None,
        }
    }
}

/// Conversion from a generic [`Outcome`] to an operation's result type.
pub(crate) trait FromOutcome: Sized {
    fn from_outcome(outcome: Outcome) -> CoreResult<Self>;
}

impl FromOutcome for Response {
    fn from_outcome(outcome: Outcome) -> CoreResult<Self> {
        match outcome {
            Outcome::Response(response) => Ok(response),
            other => Err(mismatch("response", &other)),
        }
    }
}

impl FromOutcome for bool {
    fn from_outcome(outcome: Outcome) -> CoreResult<Self> {
        match outcome {
            Outcome::Exists(found) => Ok(found),
            other => Err(mismatch("exists", &other)),
        }
    }
}

impl FromOutcome for Vec<String> {
    fn from_outcome(outcome: Outcome) -> CoreResult<Self> {
        match outcome {
            Outcome::Keys(keys) => Ok(keys),
            other => Err(mismatch("keys", &other)),
        }
    }
}

fn mismatch(expected: &str, got: &Outcome) -> CoreError {
    CoreError::invalid_operation(format!("expected {expected} outcome, got {got:?}"))
}

/// The pending result of an operation.
///
/// The operation is issued (or queued) when the method returning the reply
/// is called and runs to completion on the runtime whether or not the reply
/// is polled; dropping the reply only discards the result.
pub struct Reply<T> {
    inner: BoxFuture<'static, CoreResult<T>>,
}

impl<T: Send + 'static> Reply<T> {
    pub(crate) fn new(future: impl Future<Output = CoreResult<T>> + Send + 'static) -> Self {
        Self {
            inner: future.boxed(),
        }
    }
}

impl<T: FromOutcome + Send + 'static> Reply<T> {
    pub(crate) fn typed(outcome: BoxFuture<'static, CoreResult<Outcome>>) -> Self {
        Self::new(async move { T::from_outcome(outcome.await?) })
    }
}

impl<T> Future for Reply<T> {
    type Output = CoreResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.poll_unpin(cx)
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply").finish_non_exhaustive()
    }
}

/// Queues `command` if not connected, otherwise issues it immediately.
///
/// Outside a Tokio runtime an issued command is driven by polling the
/// returned future instead.
pub(crate) fn dispatch(
    connection: &ConnectionManager,
    ops: &Operations,
    command: Command,
) -> BoxFuture<'static, CoreResult<Outcome>> {
    match connection.route(command) {
        Route::Execute(conn, command) => {
            let issued = ops.execute(&conn, command);
            match Handle::try_current() {
                Ok(runtime) => {
                    let (deliver, rx) = oneshot::channel();
                    drive(&runtime, issued, deliver);
                    receive(rx)
                }
                Err(_) => issued,
            }
        }
        Route::Queued(rx) => receive(rx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{RequestEvent, RequestKind};
    use dex_engine::TransactionMode;

    fn response() -> Response {
        Response {
            item: None,
            event: RequestEvent {
                kind: RequestKind::Delete,
                transaction: 1,
                mode: TransactionMode::ReadWrite,
                store: "__dex__".into(),
            },
        }
    }

    #[tokio::test]
    async fn typed_reply_extracts_matching_outcome() {
        let reply: Reply<bool> = Reply::typed(async { Ok(Outcome::Exists(true)) }.boxed());
        assert!(reply.await.unwrap());

        let reply: Reply<Response> =
            Reply::typed(async { Ok(Outcome::Response(response())) }.boxed());
        assert_eq!(reply.await.unwrap(), response());
    }

    #[tokio::test]
    async fn typed_reply_rejects_other_outcome() {
        let reply: Reply<Vec<String>> = Reply::typed(async { Ok(Outcome::Exists(false)) }.boxed());
        assert!(matches!(
            reply.await,
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn typed_reply_forwards_errors() {
        let reply: Reply<bool> = Reply::typed(async { Err(CoreError::Cancelled) }.boxed());
        assert_eq!(reply.await, Err(CoreError::Cancelled));
    }

    #[test]
    fn outcome_accessors() {
        assert_eq!(Outcome::Exists(true).exists(), Some(true));
        assert!(Outcome::Exists(true).response().is_none());
        assert_eq!(
            Outcome::Response(response()).response(),
            Some(&response())
        );
    }

    #[test]
    fn command_names() {
        let command = Command::Set {
            key: "a".into(),
            value: StoredValue::Raw(serde_json::json!(1)),
        };
        assert_eq!(command.name(), "set");
        assert!(format!("{command:?}").contains("Set"));
    }
}
