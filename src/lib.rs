//! # http-bridge
//!
//! An embedded async HTTP/1.1 server whose responses are computed elsewhere.
//!
//! The engine accepts a request on its own task; the response is produced by
//! an asynchronous handler that may finish at any time, on any task. Each
//! accepted request gets a [`RequestId`], and answering that id completes the
//! original connection exactly once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use http_bridge::{BridgeConfig, HttpBridge};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = HttpBridge::new(BridgeConfig::default());
//!     bridge.on_method("POST", |body: String| async move {
//!         serde_json::json!({ "status": 200, "data": body })
//!     })?;
//!     let url = bridge.start(8080)?;
//!     println!("Listening on {url}");
//!     tokio::signal::ctrl_c().await?;
//!     bridge.stop();
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;

pub use bridge::{
    CompletionOutcome, HttpBridge, InboundEvent, IntoReply, OutboundResponse, Reply, RequestId,
    ServerState,
};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use http::{Method, StatusCode};
