//! The embedded HTTP engine.
//!
//! An [`Engine`] owns the listening socket, parses requests and writes
//! responses. It knows nothing about request identities: for every inbound
//! request it calls the [`RequestHook`] installed for the request's method,
//! handing over the body text and a single-use [`Completion`]. The response
//! is written whenever, and from wherever, that completion is fulfilled.
//!
//! [`TcpEngine`] is the Tokio implementation used by
//! [`HttpBridge::new`](crate::HttpBridge::new).

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::http::{Method, Response, StatusCode};

pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

pub use tcp::TcpEngine;

/// Errors produced by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine is already bound")]
    AlreadyBound,

    #[error("engine must be bound from within a Tokio runtime")]
    NoRuntime,
}

/// Callback installed per method. Receives the request body as text and the
/// completion that answers the request.
pub type RequestHook = Arc<dyn Fn(String, Completion) + Send + Sync + 'static>;

/// The receiving half of a [`Completion`], held by the engine's connection task.
pub type CompletionReceiver = oneshot::Receiver<Response>;

/// The engine contract the bridge is written against.
///
/// All methods are synchronous: binding happens before [`bind`](Self::bind)
/// returns, and request handling runs on the engine's own tasks.
pub trait Engine: Send + Sync + 'static {
    /// Starts accepting connections on `port` and returns the base URL.
    fn bind(&self, port: u16) -> Result<String, EngineError>;

    /// Stops accepting connections. A no-op when not bound.
    fn unbind(&self);

    /// Routes every request with `method` to `hook`, replacing any hook
    /// previously installed for that method.
    fn install_handler(&self, method: Method, hook: RequestHook);

    /// Removes every installed hook.
    fn remove_handlers(&self);
}

/// Single-use capability that answers one accepted request.
///
/// [`fulfil`](Self::fulfil) consumes the completion, so a request can never be
/// answered twice. Dropping a completion without fulfilling it abandons the
/// request: the engine closes the connection without writing a response.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Response>,
}

impl Completion {
    /// Creates a completion and the receiver the engine waits on.
    pub fn pair() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Returns `true` once the engine stopped waiting for this completion
    /// (connection closed or request timed out).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Answers the request with `status`, a UTF-8 `body` and `content_type`.
    ///
    /// Returns `false` if the connection was already gone.
    pub fn fulfil(self, status: StatusCode, body: String, content_type: &str) -> bool {
        let response = Response::new(status).content_type(content_type).body(body);
        self.tx.send(response).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fulfil_delivers_response() {
        let (completion, rx) = Completion::pair();
        assert!(completion.fulfil(StatusCode::CREATED, "{}".to_owned(), "application/json"));

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("content-type"), Some("application/json"));
        assert_eq!(response.body_bytes(), b"{}");
    }

    #[tokio::test]
    async fn dropped_completion_abandons() {
        let (completion, rx) = Completion::pair();
        drop(completion);
        assert!(rx.await.is_err());
    }

    #[test]
    fn fulfil_after_receiver_gone() {
        let (completion, rx) = Completion::pair();
        assert!(!completion.is_closed());
        drop(rx);
        assert!(completion.is_closed());
        assert!(!completion.fulfil(StatusCode::OK, String::new(), "application/json"));
    }
}
