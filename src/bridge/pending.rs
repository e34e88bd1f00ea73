//! The pending request table.
//!
//! Maps each accepted request's [`RequestId`] to the [`Completion`] that
//! answers it. Removal happens under the same lock as lookup, so a request is
//! answered at most once no matter how many tasks race to complete it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::engine::Completion;
use crate::error::BridgeError;
use crate::http::{Method, StatusCode};

/// How many completed identities are remembered to tell a duplicate
/// completion apart from an unknown one.
const RETIRED_CAPACITY: usize = 1024;

/// Table size at which `put` first sweeps out requests the engine gave up on.
/// The next sweep waits until the table has doubled again.
const PRUNE_THRESHOLD: usize = 1024;

/// Correlation key minted for every accepted request.
///
/// A random (v4) UUID, rendered in its hyphenated lowercase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What happened to a call to [`PendingRequests::complete`].
///
/// Only `Delivered` answers a request; the other outcomes are logged and
/// otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The response was handed to the engine.
    Delivered,
    /// The request was already answered.
    DuplicateCompletion,
    /// No such request is pending: never accepted, abandoned by a stop, or
    /// already given up on by the engine (timeout or disconnect).
    UnknownRequest,
    /// The status is not a three-digit HTTP code; the request stays pending.
    InvalidStatus,
}

struct PendingRequest {
    completion: Completion,
    method: Method,
    accepted_at: Instant,
}

struct Table {
    open: bool,
    entries: HashMap<RequestId, PendingRequest>,
    prune_at: usize,
    retired: HashSet<RequestId>,
    retired_order: VecDeque<RequestId>,
}

impl Table {
    fn retire(&mut self, id: RequestId) {
        if self.retired_order.len() == RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired.insert(id);
        self.retired_order.push_back(id);
    }

    fn prune(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|_, pending| !pending.completion.is_closed());
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(pruned, "dropped requests whose connection is gone");
        }
        self.prune_at = (self.entries.len() * 2).max(PRUNE_THRESHOLD);
    }
}

/// Pending completions keyed by request identity.
pub struct PendingRequests {
    table: Mutex<Table>,
    content_type: String,
}

impl PendingRequests {
    /// Creates an open table whose responses carry `content_type`.
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            table: Mutex::new(Table {
                open: true,
                entries: HashMap::new(),
                prune_at: PRUNE_THRESHOLD,
                retired: HashSet::new(),
                retired_order: VecDeque::with_capacity(RETIRED_CAPACITY),
            }),
            content_type: content_type.into(),
        }
    }

    /// Creates a table that rejects requests until [`open`](Self::open).
    pub fn closed(content_type: impl Into<String>) -> Self {
        let pending = Self::new(content_type);
        pending.table().open = false;
        pending
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the completion for a freshly accepted request.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotRunning`] if the table was closed by [`clear`](Self::clear).
    /// - [`BridgeError::DuplicateIdentity`] if `id` is already pending.
    ///
    /// On error the completion is dropped, abandoning the request.
    pub fn put(&self, id: RequestId, method: Method, completion: Completion) -> Result<(), BridgeError> {
        let mut table = self.table();
        if !table.open {
            return Err(BridgeError::NotRunning);
        }
        if table.entries.contains_key(&id) {
            return Err(BridgeError::DuplicateIdentity(id));
        }
        if table.entries.len() >= table.prune_at {
            table.prune();
        }
        table.entries.insert(
            id,
            PendingRequest {
                completion,
                method,
                accepted_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Answers the request `id` with `status` and `data`, exactly once.
    ///
    /// Never fails: completing an identity that is not pending is a logged
    /// no-op.
    pub fn complete(&self, id: &RequestId, status: u16, data: String) -> CompletionOutcome {
        let Some(status) = StatusCode::from_u16(status) else {
            error!(request_id = %id, status, "refusing to answer with an invalid status code");
            return CompletionOutcome::InvalidStatus;
        };

        let pending = {
            let mut table = self.table();
            let pending = table.entries.remove(id);
            match pending {
                Some(pending) if pending.completion.is_closed() => {
                    warn!(
                        request_id = %id,
                        method = %pending.method,
                        "completion for a request the engine already gave up on"
                    );
                    return CompletionOutcome::UnknownRequest;
                }
                Some(pending) => {
                    table.retire(*id);
                    pending
                }
                None if table.retired.contains(id) => {
                    warn!(request_id = %id, "a completion was attempted twice");
                    return CompletionOutcome::DuplicateCompletion;
                }
                None => {
                    warn!(request_id = %id, "completion for unknown request");
                    return CompletionOutcome::UnknownRequest;
                }
            }
        };

        debug!(
            request_id = %id,
            method = %pending.method,
            status = status.as_u16(),
            elapsed = ?pending.accepted_at.elapsed(),
            "request completed"
        );
        if !pending.completion.fulfil(status, data, &self.content_type) {
            warn!(request_id = %id, "connection closed before the response was written");
            return CompletionOutcome::UnknownRequest;
        }
        CompletionOutcome::Delivered
    }

    /// Drops every pending completion without answering it and closes the
    /// table to new requests. Returns how many requests were abandoned.
    pub fn clear(&self) -> usize {
        let abandoned: Vec<_> = {
            let mut table = self.table();
            table.open = false;
            table.prune_at = PRUNE_THRESHOLD;
            table.retired.clear();
            table.retired_order.clear();
            table.entries.drain().collect()
        };
        for (id, pending) in &abandoned {
            debug!(request_id = %id, method = %pending.method, "request abandoned");
        }
        abandoned.len()
    }

    /// Re-opens the table after a [`clear`](Self::clear).
    pub fn open(&self) {
        self.table().open = true;
    }

    /// Number of requests still awaiting a response. Requests the engine
    /// already gave up on are not counted.
    pub fn len(&self) -> usize {
        self.table()
            .entries
            .values()
            .filter(|pending| !pending.completion.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::CompletionReceiver;

    fn table() -> PendingRequests {
        PendingRequests::new("application/json")
    }

    fn accept(table: &PendingRequests) -> (RequestId, CompletionReceiver) {
        let id = RequestId::new();
        let (completion, rx) = Completion::pair();
        table.put(id, Method::Get, completion).unwrap();
        (id, rx)
    }

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<RequestId> = (0..10_000).map(|_| RequestId::new()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn id_round_trips_through_text() {
        let id = RequestId::new();
        assert_eq!(id.to_string().parse::<RequestId>().unwrap(), id);
        assert!("not-an-id".parse::<RequestId>().is_err());
    }

    #[tokio::test]
    async fn complete_delivers_exactly_once() {
        let table = table();
        let (id, rx) = accept(&table);

        let outcome = table.complete(&id, 200, r#"{"ok":true}"#.to_owned());
        assert_eq!(outcome, CompletionOutcome::Delivered);
        assert!(table.is_empty());

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type"), Some("application/json"));
        assert_eq!(response.body_bytes(), br#"{"ok":true}"#);

        assert_eq!(
            table.complete(&id, 500, "again".to_owned()),
            CompletionOutcome::DuplicateCompletion
        );
    }

    #[test]
    fn unknown_id_is_noop() {
        let table = table();
        let (_id, _rx) = accept(&table);
        assert_eq!(
            table.complete(&RequestId::new(), 200, String::new()),
            CompletionOutcome::UnknownRequest
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_identity_rejected() {
        let table = table();
        let (id, _rx) = accept(&table);
        let (completion, _rx2) = Completion::pair();
        assert!(matches!(
            table.put(id, Method::Post, completion),
            Err(BridgeError::DuplicateIdentity(dup)) if dup == id
        ));
    }

    #[test]
    fn invalid_status_keeps_request_pending() {
        let table = table();
        let (id, _rx) = accept(&table);
        assert_eq!(table.complete(&id, 42, String::new()), CompletionOutcome::InvalidStatus);
        assert_eq!(table.len(), 1);
        assert_eq!(table.complete(&id, 204, String::new()), CompletionOutcome::Delivered);
    }

    #[tokio::test]
    async fn clear_abandons_everything() {
        let table = table();
        let accepted: Vec<_> = (0..25).map(|_| accept(&table)).collect();

        assert_eq!(table.clear(), 25);
        assert!(table.is_empty());

        for (id, rx) in accepted {
            assert_eq!(
                table.complete(&id, 200, String::new()),
                CompletionOutcome::UnknownRequest
            );
            assert!(rx.await.is_err());
        }
    }

    #[test]
    fn requests_the_engine_gave_up_on_are_not_pending() {
        let table = table();
        let (timed_out, rx) = accept(&table);
        drop(rx);
        let (_live, _rx) = accept(&table);

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.complete(&timed_out, 200, String::new()),
            CompletionOutcome::UnknownRequest
        );
        assert_eq!(
            table.complete(&timed_out, 200, String::new()),
            CompletionOutcome::UnknownRequest
        );
    }

    #[test]
    fn put_sweeps_closed_entries_once_the_table_grows() {
        let table = table();
        for _ in 0..PRUNE_THRESHOLD - 1 {
            let (_id, rx) = accept(&table);
            drop(rx);
        }
        let (_live, _rx) = accept(&table);
        assert_eq!(table.table().entries.len(), PRUNE_THRESHOLD);

        let (_next, _rx2) = accept(&table);
        assert_eq!(table.table().entries.len(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn completed_ids_are_forgotten_past_capacity() {
        let table = table();
        let mut ids = Vec::with_capacity(RETIRED_CAPACITY + 1);
        for _ in 0..=RETIRED_CAPACITY {
            let (id, _rx) = accept(&table);
            assert_eq!(table.complete(&id, 204, String::new()), CompletionOutcome::Delivered);
            ids.push(id);
        }

        assert_eq!(
            table.complete(&ids[0], 200, String::new()),
            CompletionOutcome::UnknownRequest
        );
        assert_eq!(
            table.complete(&ids[1], 200, String::new()),
            CompletionOutcome::DuplicateCompletion
        );
        assert_eq!(
            table.complete(&ids[RETIRED_CAPACITY], 200, String::new()),
            CompletionOutcome::DuplicateCompletion
        );
    }

    #[test]
    fn closed_table_rejects_until_reopened() {
        let table = table();
        table.clear();
        let (completion, _rx) = Completion::pair();
        assert!(matches!(
            table.put(RequestId::new(), Method::Get, completion),
            Err(BridgeError::NotRunning)
        ));

        table.open();
        let (_id, _rx) = accept(&table);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_completions_deliver_once() {
        let table = std::sync::Arc::new(table());
        let (id, mut rx) = accept(&table);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = std::sync::Arc::clone(&table);
                std::thread::spawn(move || table.complete(&id, 200, "x".to_owned()))
            })
            .collect();
        let delivered = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == CompletionOutcome::Delivered)
            .count();

        assert_eq!(delivered, 1);
        assert!(rx.try_recv().is_ok());
    }
}
