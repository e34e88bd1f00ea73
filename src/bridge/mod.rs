//! The request bridge: lifecycle, subscriptions, correlation and dispatch.
//!
//! [`HttpBridge`] owns an [`Engine`] and connects it to asynchronous
//! handlers. Every accepted request is given a [`RequestId`], parked in the
//! [`PendingRequests`] table and announced to the method's listener; the
//! request is answered when [`HttpBridge::respond`] (or a handler registered
//! with [`HttpBridge::on_method`]) completes that identity.
//!
//! ```text
//! engine ──hook──▶ PendingRequests::put ──▶ Dispatcher::publish ──▶ handler task
//!   ▲                                                                   │
//!   └──── Completion::fulfil ◀── PendingRequests::complete ◀── respond ─┘
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::engine::{Engine, TcpEngine};
use crate::error::BridgeError;
use crate::http::Method;

pub mod dispatch;
pub mod handler;
pub mod pending;
pub mod subscription;

pub use dispatch::{Dispatcher, InboundEvent, Listener};
pub use handler::{ErrorHandler, IntoReply, OutboundResponse, Reply};
pub use pending::{CompletionOutcome, PendingRequests, RequestId};
pub use subscription::Subscriptions;

use handler::ErrorHandlerSlot;

/// Whether the engine is accepting connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running,
}

struct Lifecycle {
    state: ServerState,
    url: Option<String>,
}

/// An embedded HTTP server whose responses are computed asynchronously.
///
/// # Examples
///
/// ```rust,no_run
/// use http_bridge::{BridgeConfig, HttpBridge, Reply};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let bridge = HttpBridge::new(BridgeConfig::default());
///     bridge.on_method("GET", |_body: String| async {
///         Reply::new(200, r#"{"ok":true}"#)
///     })?;
///     let url = bridge.start(8080)?;
///     println!("listening on {url}");
///     tokio::signal::ctrl_c().await?;
///     bridge.stop();
///     Ok(())
/// }
/// ```
pub struct HttpBridge<E: Engine = TcpEngine> {
    engine: Arc<E>,
    config: BridgeConfig,
    lifecycle: Mutex<Lifecycle>,
    subscriptions: Subscriptions,
    pending: Arc<PendingRequests>,
    dispatcher: Arc<Dispatcher>,
    errors: ErrorHandlerSlot,
}

impl HttpBridge<TcpEngine> {
    /// Creates a stopped bridge backed by a [`TcpEngine`].
    pub fn new(config: BridgeConfig) -> Self {
        let engine = TcpEngine::new(&config);
        Self::with_engine(engine, config)
    }
}

impl<E: Engine> HttpBridge<E> {
    /// Creates a stopped bridge backed by `engine`.
    pub fn with_engine(engine: E, config: BridgeConfig) -> Self {
        let pending = Arc::new(PendingRequests::closed(config.content_type.clone()));
        Self {
            engine: Arc::new(engine),
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                url: None,
            }),
            subscriptions: Subscriptions::new(),
            pending,
            dispatcher: Arc::new(Dispatcher::new()),
            errors: ErrorHandlerSlot::default(),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the engine to `port` and returns the server's base URL.
    ///
    /// Port `0` binds an ephemeral port; the returned URL carries the
    /// resolved one. Must be called from within a Tokio runtime when backed
    /// by [`TcpEngine`].
    ///
    /// # Errors
    ///
    /// - [`BridgeError::AlreadyRunning`] if the server is running; it keeps
    ///   serving on its current port.
    /// - [`BridgeError::BindFailed`] if the engine cannot bind; the server
    ///   stays stopped.
    pub fn start(&self, port: u16) -> Result<String, BridgeError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == ServerState::Running {
            warn!(port, "start requested while running");
            return Err(BridgeError::AlreadyRunning);
        }

        let url = self
            .engine
            .bind(port)
            .map_err(|source| BridgeError::BindFailed { port, source })?;
        self.pending.open();

        lifecycle.state = ServerState::Running;
        lifecycle.url = Some(url.clone());
        info!(%url, "server started");
        Ok(url)
    }

    /// Stops the server.
    ///
    /// Unbinds the engine, drops every subscription and listener, and
    /// abandons every pending request without answering it. Returns `false`
    /// if the server was already stopped, in which case nothing happens.
    pub fn stop(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == ServerState::Stopped {
            return false;
        }

        self.engine.unbind();
        self.engine.remove_handlers();
        let methods = self.subscriptions.clear();
        self.dispatcher.unsubscribe_all();
        let abandoned = self.pending.clear();

        lifecycle.state = ServerState::Stopped;
        lifecycle.url = None;
        info!(methods, abandoned, "server stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle().state
    }

    /// The base URL while running.
    pub fn url(&self) -> Option<String> {
        self.lifecycle().url.clone()
    }

    /// Installs the bridging hook for `method` if it is not installed yet.
    ///
    /// Requests for a method with no listener are answered with `503`; pair
    /// this with [`on_event`](Self::on_event) or use
    /// [`on_method`](Self::on_method).
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnsupportedMethod`] unless `method` is one of GET,
    /// POST, PUT, PATCH or DELETE (any case).
    pub fn subscribe(&self, method: &str) -> Result<Method, BridgeError> {
        let method = parse_method(method)?;
        let pending = Arc::clone(&self.pending);
        let dispatcher = Arc::clone(&self.dispatcher);
        let hook_method = method.clone();
        self.subscriptions.subscribe(self.engine.as_ref(), method.clone(), move || {
            subscription::bridging_hook(hook_method, pending, dispatcher)
        });
        Ok(method)
    }

    /// Registers a raw listener for `method` and subscribes to it.
    ///
    /// The listener must eventually call [`respond`](Self::respond) with the
    /// event's request id. It runs on the engine's task and must not block.
    pub fn on_event<L>(&self, method: &str, listener: L) -> Result<Method, BridgeError>
    where
        L: Fn(InboundEvent) + Send + Sync + 'static,
    {
        let parsed = parse_method(method)?;
        self.dispatcher.subscribe(parsed, Arc::new(listener));
        self.subscribe(method)
    }

    /// Registers an async `handler` for `method` and subscribes to it.
    ///
    /// The handler receives the request body (empty when absent) and
    /// resolves to a [`Reply`], a `serde_json::Value` shaped like
    /// `{"status": 200, "data": "..."}`, or a `Result` of either. A later
    /// registration for the same method replaces this one.
    pub fn on_method<H, F>(&self, method: &str, handler: H) -> Result<Method, BridgeError>
    where
        H: Fn(String) -> F + Send + Sync + 'static,
        F: Future + Send + 'static,
        F::Output: IntoReply + Send + 'static,
    {
        let parsed = parse_method(method)?;
        let listener = handler::listener(handler, Arc::clone(&self.pending), Arc::clone(&self.errors));
        self.dispatcher.subscribe(parsed, listener);
        self.subscribe(method)
    }

    /// Installs the error handler used when a handler flow fails.
    ///
    /// Without one, failed flows are only logged and their connections are
    /// left to the engine's request timeout.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&BridgeError) -> (u16, Value) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        *self.errors.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Answers the request `request_id`.
    ///
    /// Completing a request twice, or one abandoned by [`stop`](Self::stop),
    /// is a logged no-op reported through the returned outcome.
    pub fn respond(&self, request_id: &RequestId, status: u16, data: impl Into<String>) -> CompletionOutcome {
        self.pending.complete(request_id, status, data.into())
    }

    /// Number of requests accepted but not yet answered.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Methods with an installed bridging hook, in no particular order.
    pub fn subscribed_methods(&self) -> Vec<Method> {
        self.subscriptions.subscribed()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

fn parse_method(method: &str) -> Result<Method, BridgeError> {
    match method.parse::<Method>() {
        Ok(parsed) if parsed.is_subscribable() => Ok(parsed),
        _ => Err(BridgeError::UnsupportedMethod(method.to_owned())),
    }
}
