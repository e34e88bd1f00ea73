//! Asynchronous handlers and the validation of what they return.
//!
//! A handler receives the request body and resolves to something that can
//! become a [`Reply`]. Dynamically shaped results (`serde_json::Value`) must
//! look like `{"status": <integer>, "data": <string>}`; any other shape fails
//! the request's flow with [`BridgeError::MalformedHandlerResult`] instead of
//! being coerced.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use super::dispatch::{InboundEvent, Listener};
use super::pending::{PendingRequests, RequestId};
use crate::error::BridgeError;
use crate::http::StatusCode;

/// Maps a failed handler flow to a `(status, data)` answer. `data` is
/// serialized as JSON before it is sent.
pub type ErrorHandler = Arc<dyn Fn(&BridgeError) -> (u16, Value) + Send + Sync + 'static>;

pub(crate) type ErrorHandlerSlot = Arc<RwLock<Option<ErrorHandler>>>;

/// A validated handler answer.
///
/// # Examples
///
/// ```
/// use http_bridge::Reply;
///
/// let reply = Reply::json(201, &serde_json::json!({ "id": 7 })).unwrap();
/// assert_eq!(reply.status, 201);
/// assert_eq!(reply.data, r#"{"id":7}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: u16,
    pub data: String,
}

impl Reply {
    pub fn new(status: u16, data: impl Into<String>) -> Self {
        Self {
            status,
            data: data.into(),
        }
    }

    /// A reply whose data is `value` serialized as JSON.
    pub fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(status, serde_json::to_string(value)?))
    }
}

/// The answer for one request, ready for the pending table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub request_id: RequestId,
    pub status: u16,
    pub data: String,
}

impl OutboundResponse {
    pub fn new(request_id: RequestId, reply: Reply) -> Self {
        Self {
            request_id,
            status: reply.status,
            data: reply.data,
        }
    }
}

/// Conversion of a handler's output into a [`Reply`].
pub trait IntoReply {
    fn into_reply(self) -> Result<Reply, BridgeError>;
}

impl IntoReply for Reply {
    fn into_reply(self) -> Result<Reply, BridgeError> {
        Ok(self)
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> Result<Reply, BridgeError> {
        let mut fields = match self {
            Value::Object(fields) => fields,
            other => {
                return Err(BridgeError::malformed(format!(
                    "expected an object with `status` and `data`, got {}",
                    kind(&other)
                )));
            }
        };

        let status = match fields.get("status") {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .filter(|n| StatusCode::from_u16(*n).is_some())
                .ok_or_else(|| BridgeError::malformed(format!("status {n} is not an HTTP status code")))?,
            Some(other) => {
                return Err(BridgeError::malformed(format!(
                    "status must be of type number, got {}",
                    kind(other)
                )));
            }
            None => return Err(BridgeError::malformed("missing `status`")),
        };

        let data = match fields.remove("data") {
            Some(Value::String(data)) => data,
            Some(other) => {
                return Err(BridgeError::malformed(format!(
                    "data must be of type string, got {}",
                    kind(&other)
                )));
            }
            None => return Err(BridgeError::malformed("missing `data`")),
        };

        Ok(Reply { status, data })
    }
}

/// A handler that fails is routed to the error handler, when one is set.
impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: fmt::Display,
{
    fn into_reply(self) -> Result<Reply, BridgeError> {
        self.map_err(|e| BridgeError::HandlerFailed(e.to_string()))?
            .into_reply()
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Wraps `handler` into a dispatcher listener.
///
/// Every event spawns a task that runs the handler, validates its output and
/// completes the request. Failures are logged and, if an error handler is
/// installed, answered through it; otherwise the request is left to the
/// engine's timeout.
pub(crate) fn listener<H, F>(
    handler: H,
    pending: Arc<PendingRequests>,
    errors: ErrorHandlerSlot,
) -> Listener
where
    H: Fn(String) -> F + Send + Sync + 'static,
    F: Future + Send + 'static,
    F::Output: IntoReply + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |event: InboundEvent| {
        let work = handler(event.body);
        let pending = Arc::clone(&pending);
        let errors = Arc::clone(&errors);
        let request_id = event.request_id;

        tokio::spawn(async move {
            let reply = match tokio::spawn(work).await {
                Ok(output) => output.into_reply(),
                Err(e) if e.is_panic() => Err(BridgeError::HandlerPanicked(request_id)),
                Err(_) => return,
            };
            match reply {
                Ok(reply) => {
                    let response = OutboundResponse::new(request_id, reply);
                    pending.complete(&response.request_id, response.status, response.data);
                }
                Err(e) => fail(request_id, &e, &pending, &errors),
            }
        });
    })
}

fn fail(request_id: RequestId, e: &BridgeError, pending: &PendingRequests, errors: &ErrorHandlerSlot) {
    error!(request_id = %request_id, error = %e, "handler flow failed");

    let handler = errors
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let Some(handler) = handler else {
        return;
    };

    let (status, data) = handler(e);
    match serde_json::to_string(&data) {
        Ok(data) => {
            pending.complete(&request_id, status, data);
        }
        Err(e) => error!(request_id = %request_id, error = %e, "error handler produced unserializable data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::engine::Completion;
    use crate::http::Method;

    #[test]
    fn value_with_number_and_string_is_accepted() {
        let reply = json!({ "status": 200, "data": "{\"ok\":true}" }).into_reply().unwrap();
        assert_eq!(reply, Reply::new(200, "{\"ok\":true}"));
    }

    #[test]
    fn textual_status_is_malformed() {
        let err = json!({ "status": "200", "data": "ok" }).into_reply().unwrap_err();
        assert!(matches!(err, BridgeError::MalformedHandlerResult { .. }));
        assert!(err.to_string().contains("status must be of type number"));
    }

    #[test]
    fn non_textual_data_is_malformed() {
        let err = json!({ "status": 200, "data": { "ok": true } }).into_reply().unwrap_err();
        assert!(err.to_string().contains("data must be of type string"));
    }

    #[test]
    fn out_of_range_status_is_malformed() {
        for status in [json!(42), json!(1000), json!(-1), json!(200.5)] {
            let result = json!({ "status": status, "data": "" }).into_reply();
            assert!(matches!(result, Err(BridgeError::MalformedHandlerResult { .. })));
        }
    }

    #[test]
    fn non_object_is_malformed() {
        assert!(json!("ok").into_reply().is_err());
        assert!(json!({ "data": "x" }).into_reply().is_err());
    }

    #[test]
    fn handler_error_becomes_handler_failed() {
        let result: Result<Reply, String> = Err("boom".to_owned());
        assert!(matches!(result.into_reply(), Err(BridgeError::HandlerFailed(msg)) if msg == "boom"));
    }

    fn accepted(pending: &PendingRequests) -> (RequestId, crate::engine::CompletionReceiver) {
        let id = RequestId::new();
        let (completion, rx) = Completion::pair();
        pending.put(id, Method::Post, completion).unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn listener_completes_request() {
        let pending = Arc::new(PendingRequests::new("application/json"));
        let (id, rx) = accepted(&pending);
        let listener = listener(
            |body: String| async move { Reply::new(201, body) },
            Arc::clone(&pending),
            ErrorHandlerSlot::default(),
        );

        listener(InboundEvent {
            request_id: id,
            method: Method::Post,
            body: "echo".to_owned(),
        });

        let response = rx.await.unwrap();
        assert_eq!(response.status().as_u16(), 201);
        assert_eq!(response.body_bytes(), b"echo");
    }

    #[tokio::test]
    async fn error_handler_answers_failed_flow() {
        let pending = Arc::new(PendingRequests::new("application/json"));
        let (id, rx) = accepted(&pending);
        let errors = ErrorHandlerSlot::default();
        let on_error: ErrorHandler =
            Arc::new(|e: &BridgeError| (500, json!({ "error": e.to_string() })));
        *errors.write().unwrap() = Some(on_error);
        let listener = listener(
            |_body: String| async { json!({ "status": "500", "data": "x" }) },
            Arc::clone(&pending),
            errors,
        );

        listener(InboundEvent {
            request_id: id,
            method: Method::Post,
            body: String::new(),
        });

        let response = rx.await.unwrap();
        assert_eq!(response.status().as_u16(), 500);
        let body: Value = serde_json::from_slice(response.body_bytes()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("malformed handler result"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let pending = Arc::new(PendingRequests::new("application/json"));
        let (id, _rx) = accepted(&pending);
        let listener = listener(
            |body: String| async move {
                if body.is_empty() {
                    panic!("handler bug");
                }
                Reply::new(200, body)
            },
            Arc::clone(&pending),
            ErrorHandlerSlot::default(),
        );

        listener(InboundEvent {
            request_id: id,
            method: Method::Post,
            body: String::new(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(pending.len(), 1);
    }
}
