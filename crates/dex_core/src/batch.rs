//! Batched operations.
//!
//! A batch collects commands while a call chain is built and runs them as
//! one unit when [`Batch::end`] is called:
//!
//! ```rust,ignore
//! let outcomes = db.batch().set("a", json!(1)).get("a").end().await?;
//! ```
//!
//! Commands are issued in submission order through the dispatcher, so they
//! share the cached transactions (or wait in the pending-call queue together).
//! Each completion publishes a `progress` event; results are returned in
//! submission order, and the first failure fails the whole batch.

use crate::database::Database;
use crate::dispatch::{Command, Outcome};
use crate::error::CoreResult;
use crate::events::{Event, EventBus};
use crate::item::StoredValue;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use tracing::debug;

/// Chainable handle appending commands to a database's current batch.
#[derive(Debug)]
pub struct Batch<'a> {
    db: &'a Database,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Adds a `set` of `value` under `key`.
    #[must_use]
    pub fn set(self, key: impl Into<String>, value: impl Into<StoredValue>) -> Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Adds a `get` of `key`.
    #[must_use]
    pub fn get(self, key: impl Into<String>) -> Self {
        self.push(Command::Get { key: key.into() })
    }

    /// Adds a `del` of `key`.
    #[must_use]
    pub fn del(self, key: impl Into<String>) -> Self {
        self.push(Command::Del { key: key.into() })
    }

    /// Adds an `exists` check of `key`.
    #[must_use]
    pub fn exists(self, key: impl Into<String>) -> Self {
        self.push(Command::Exists { key: key.into() })
    }

    /// Number of commands in the current batch.
    pub fn len(&self) -> usize {
        self.db.batch_len()
    }

    /// Returns true if the current batch has no commands.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the batch. See [`Database::end`].
    pub fn end(self) -> crate::Reply<Vec<Outcome>> {
        self.db.end()
    }

    fn push(self, command: Command) -> Self {
        self.db.push_batch(command);
        self
    }
}

/// Awaits issued batch commands, publishing progress as they complete.
///
/// Fails fast: the first error is returned and the remaining results are
/// dropped.
pub(crate) async fn collect(
    replies: Vec<BoxFuture<'static, CoreResult<Outcome>>>,
    events: Arc<EventBus>,
) -> CoreResult<Vec<Outcome>> {
    let total = replies.len();
    let mut pending: FuturesUnordered<_> = replies
        .into_iter()
        .enumerate()
        .map(|(index, reply)| reply.map(move |result| (index, result)))
        .collect();
    let mut results: Vec<Option<Outcome>> = (0..total).map(|_| None).collect();

    while let Some((index, result)) = pending.next().await {
        events.publish(Event::Progress {
            index,
            outcome: result.clone(),
        });
        match result {
            Ok(outcome) => results[index] = Some(outcome),
            Err(err) => {
                debug!(index, total, error = %err, "batch failed");
                return Err(err);
            }
        }
    }

    debug!(total, "batch done");
    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::events::EventKind;

    fn ready(outcome: CoreResult<Outcome>) -> BoxFuture<'static, CoreResult<Outcome>> {
        futures::future::ready(outcome).boxed()
    }

    #[tokio::test]
    async fn results_follow_submission_order() {
        let events = Arc::new(EventBus::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let slow = async move { rx.await.unwrap_or(Err(CoreError::Cancelled)) }.boxed();
        let replies = vec![slow, ready(Ok(Outcome::Exists(true)))];

        let release = async move {
            tokio::task::yield_now().await;
            tx.send(Ok(Outcome::Exists(false))).unwrap();
        };
        let (results, ()) = tokio::join!(collect(replies, Arc::clone(&events)), release);
        let results = results.unwrap();

        assert_eq!(results, vec![Outcome::Exists(false), Outcome::Exists(true)]);
        let indexes: Vec<_> = events
            .history_of(EventKind::Progress)
            .into_iter()
            .map(|e| match e {
                Event::Progress { index, .. } => index,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(indexes, vec![1, 0]);
    }

    #[tokio::test]
    async fn first_error_fails_the_batch() {
        let events = Arc::new(EventBus::new());
        let replies = vec![
            ready(Ok(Outcome::Exists(true))),
            ready(Err(CoreError::Cancelled)),
            ready(Ok(Outcome::Exists(true))),
        ];

        assert_eq!(collect(replies, events).await, Err(CoreError::Cancelled));
    }

    #[tokio::test]
    async fn empty_batch_resolves_to_empty_list() {
        let events = Arc::new(EventBus::new());
        assert_eq!(collect(Vec::new(), Arc::clone(&events)).await, Ok(Vec::new()));
        assert_eq!(events.history_len(), 0);
    }
}
