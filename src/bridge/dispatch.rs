//! Method-keyed event dispatch.
//!
//! Each HTTP method is a topic with at most one listener. Publishing hands
//! the event to that listener and returns straight away; the listener is
//! expected to spawn whatever work produces the response.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::RequestId;
use crate::http::Method;

/// Notification that a request was accepted and is waiting for a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub request_id: RequestId,
    pub method: Method,
    pub body: String,
}

/// Receives the events published on one method topic.
pub type Listener = Arc<dyn Fn(InboundEvent) + Send + Sync + 'static>;

#[derive(Default)]
pub struct Dispatcher {
    listeners: Mutex<HashMap<Method, Listener>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<Method, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `listener` for `method`. The last registration wins; returns
    /// `true` if an earlier listener was replaced.
    pub fn subscribe(&self, method: Method, listener: Listener) -> bool {
        let replaced = self.listeners().insert(method.clone(), listener).is_some();
        if replaced {
            debug!(%method, "listener replaced");
        }
        replaced
    }

    /// Delivers `event` to the listener for `method`.
    ///
    /// Returns `false` when nobody listens on that method.
    pub fn publish(&self, method: &Method, event: InboundEvent) -> bool {
        let listener = self.listeners().get(method).cloned();
        match listener {
            Some(listener) => {
                listener(event);
                true
            }
            None => false,
        }
    }

    /// Removes every listener, returning how many were registered.
    pub fn unsubscribe_all(&self) -> usize {
        let mut listeners = self.listeners();
        let count = listeners.len();
        listeners.clear();
        count
    }
}
