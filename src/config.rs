//! Bridge configuration.
//!
//! Built fluently in code or deserialized from JSON; every field has a
//! default so a partial document is accepted.
//!
//! ```
//! use http_bridge::BridgeConfig;
//!
//! let config: BridgeConfig =
//!     serde_json::from_str(r#"{ "host": "0.0.0.0", "request_timeout_ms": null }"#).unwrap();
//! assert_eq!(config.host, "0.0.0.0");
//! assert_eq!(config.content_type, "application/json");
//! assert!(config.request_timeout_ms.is_none());
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Maximum size of a complete HTTP request the engine buffers (8 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Interface the engine binds to.
    pub host: String,
    /// Content type written on every handler response.
    pub content_type: String,
    /// How long the engine waits for a completion before answering
    /// `504 Gateway Timeout`. `None` waits until the server stops.
    pub request_timeout_ms: Option<u64>,
    pub max_request_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            content_type: "application/json".to_owned(),
            request_timeout_ms: Some(DEFAULT_REQUEST_TIMEOUT_MS),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map(|t| t.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}
