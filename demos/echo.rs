//! Echo server: answers every POST with the body it received.
//!
//! ```text
//! RUST_LOG=http_bridge=debug cargo run --example echo
//! curl -X POST -d '{"hello":"world"}' http://127.0.0.1:8080/
//! ```

use http_bridge::{BridgeConfig, HttpBridge, Reply};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bridge = HttpBridge::new(BridgeConfig::default());

    bridge.on_error(|e| (500, json!({ "error": e.to_string() })));
    bridge.on_method("POST", |body: String| async move { Reply::new(200, body) })?;
    bridge.on_method("GET", |_body: String| async {
        json!({ "status": 200, "data": "{\"ok\":true}" })
    })?;

    let url = bridge.start(8080)?;
    tracing::info!(%url, "echo server ready");

    tokio::signal::ctrl_c().await?;
    bridge.stop();
    Ok(())
}
