//! Per-method subscription registry and the bridging hook.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tracing::{debug, warn};

use super::dispatch::{Dispatcher, InboundEvent};
use super::pending::{PendingRequests, RequestId};
use crate::engine::{Completion, Engine, RequestHook};
use crate::http::Method;

/// Tracks which methods have a bridging hook installed in the engine.
#[derive(Default)]
pub struct Subscriptions {
    methods: Mutex<HashSet<Method>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn methods(&self) -> MutexGuard<'_, HashSet<Method>> {
        self.methods.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the hook built by `make_hook` for `method`, unless one is
    /// already installed. Returns `true` on first subscription.
    pub fn subscribe<E, F>(&self, engine: &E, method: Method, make_hook: F) -> bool
    where
        E: Engine + ?Sized,
        F: FnOnce() -> RequestHook,
    {
        let mut methods = self.methods();
        if methods.contains(&method) {
            return false;
        }
        engine.install_handler(method.clone(), make_hook());
        debug!(%method, "subscribed");
        methods.insert(method);
        true
    }

    /// Subscribed methods, in no particular order.
    pub fn subscribed(&self) -> Vec<Method> {
        self.methods().iter().cloned().collect()
    }

    /// Forgets every subscription, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut methods = self.methods();
        let count = methods.len();
        methods.clear();
        count
    }
}

/// Builds the hook that turns an inbound request into a pending entry plus
/// an [`InboundEvent`] on the method's topic.
pub(crate) fn bridging_hook(
    method: Method,
    pending: Arc<PendingRequests>,
    dispatcher: Arc<Dispatcher>,
) -> RequestHook {
    Arc::new(move |body: String, completion: Completion| {
        let request_id = RequestId::new();
        if let Err(e) = pending.put(request_id, method.clone(), completion) {
            warn!(request_id = %request_id, %method, error = %e, "request abandoned");
            return;
        }
        debug!(request_id = %request_id, %method, body_len = body.len(), "request accepted");

        let event = InboundEvent {
            request_id,
            method: method.clone(),
            body,
        };
        if !dispatcher.publish(&method, event) {
            warn!(request_id = %request_id, %method, "no listener for method, answering 503");
            let data = json!({ "error": format!("no handler registered for {method}") });
            pending.complete(&request_id, 503, data.to_string());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::mock::MockEngine;
    use crate::http::StatusCode;

    fn noop_hook() -> RequestHook {
        Arc::new(|_body: String, _completion: Completion| {})
    }

    #[test]
    fn repeated_subscribe_installs_once() {
        let engine = MockEngine::new();
        let subs = Subscriptions::new();

        assert!(subs.subscribe(&engine, Method::Get, noop_hook));
        for _ in 0..5 {
            assert!(!subs.subscribe(&engine, Method::Get, noop_hook));
        }
        assert!(subs.subscribe(&engine, Method::Post, noop_hook));

        assert_eq!(engine.install_count(&Method::Get), 1);
        assert_eq!(engine.install_count(&Method::Post), 1);
        assert_eq!(subs.subscribed().len(), 2);
    }

    #[test]
    fn clear_allows_resubscribe() {
        let engine = MockEngine::new();
        let subs = Subscriptions::new();
        subs.subscribe(&engine, Method::Patch, noop_hook);
        assert_eq!(subs.clear(), 1);
        assert!(subs.subscribed().is_empty());
        assert!(subs.subscribe(&engine, Method::Patch, noop_hook));
        assert_eq!(engine.install_count(&Method::Patch), 2);
    }

    #[test]
    fn hook_registers_and_publishes() {
        let pending = Arc::new(PendingRequests::new("application/json"));
        let dispatcher = Arc::new(Dispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.subscribe(
            Method::Get,
            Arc::new(move |event: InboundEvent| sink.lock().unwrap().push(event)),
        );

        let hook = bridging_hook(Method::Get, Arc::clone(&pending), dispatcher);
        let (completion, _rx) = Completion::pair();
        hook(String::new(), completion);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].method, Method::Get);
        assert_eq!(events[0].body, "");
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn hook_without_listener_answers_503() {
        let pending = Arc::new(PendingRequests::new("application/json"));
        let hook = bridging_hook(Method::Put, Arc::clone(&pending), Arc::new(Dispatcher::new()));
        let (completion, rx) = Completion::pair();
        hook("{}".to_owned(), completion);

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn hook_on_closed_table_abandons() {
        let pending = Arc::new(PendingRequests::new("application/json"));
        pending.clear();
        let hook = bridging_hook(Method::Get, Arc::clone(&pending), Arc::new(Dispatcher::new()));
        let (completion, rx) = Completion::pair();
        hook(String::new(), completion);

        assert!(rx.await.is_err());
        assert!(pending.is_empty());
    }
}
