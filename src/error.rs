//! Errors surfaced by the bridge.

use thiserror::Error;

use crate::bridge::RequestId;
use crate::engine::EngineError;

/// Errors produced by the lifecycle, subscription and handler layers.
///
/// Lifecycle errors ([`AlreadyRunning`](Self::AlreadyRunning),
/// [`BindFailed`](Self::BindFailed)) are returned to the caller of
/// [`HttpBridge::start`](crate::HttpBridge::start). Handler-flow errors are
/// contained to the request that produced them.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("failed to bind port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: EngineError,
    },

    #[error("server is not running")]
    NotRunning,

    #[error("request identity {0} is already pending")]
    DuplicateIdentity(RequestId),

    #[error("unsupported method {0:?}: expected one of GET, POST, PUT, PATCH, DELETE")]
    UnsupportedMethod(String),

    #[error("malformed handler result: {reason}")]
    MalformedHandlerResult { reason: String },

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("handler for request {0} panicked")]
    HandlerPanicked(RequestId),
}

impl BridgeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedHandlerResult {
            reason: reason.into(),
        }
    }
}
