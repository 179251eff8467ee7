//! # Sum Server Example
//!
//! A WebSocket server that routes JSON messages by their `type` field:
//!
//! 1. `sum-request` messages are answered with a `sum-response`
//! 2. `event` messages go to a nested resolver keyed on `data.type`,
//!    which logs `info` and `error` events
//! 3. Every inbound message is logged by a middleware first
//!
//! ## Running
//!
//! ```sh
//! cargo run --example sum_server
//!
//! # Override the listen address:
//! WSOCKET_ADDR=0.0.0.0:9000 cargo run --example sum_server
//! ```
//!
//! Then, from any WebSocket client:
//!
//! ```text
//! > {"type": "sum-request", "a": 1, "b": 2}
//! < {"type": "sum-response", "result": 3}
//! > {"type": "event", "data": {"type": "info", "message": "hello"}}
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tokio::net::TcpListener;
use wsocket::{
    Client, ClientConfig, Context, JsonResolver, Message, ResponseWriter, WebSocketTransport,
};

/// Default listen address when `WSOCKET_ADDR` is not set.
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Deserialize)]
struct SumRequest {
    a: i64,
    b: i64,
}

#[derive(Deserialize)]
struct Event {
    data: EventData,
}

#[derive(Deserialize)]
struct EventData {
    #[serde(default)]
    message: String,
}

async fn handle_sum(
    _ctx: Context,
    payload: Vec<u8>,
    writer: Arc<dyn ResponseWriter>,
) -> wsocket::Result<()> {
    let request: SumRequest = serde_json::from_slice(&payload)?;
    let response = format!(
        r#"{{"type": "sum-response", "result": {}}}"#,
        request.a + request.b
    );
    writer.write_message(Message::text(response)).await
}

async fn handle_info_event(
    _ctx: Context,
    payload: Vec<u8>,
    _writer: Arc<dyn ResponseWriter>,
) -> wsocket::Result<()> {
    let event: Event = serde_json::from_slice(&payload)?;
    tracing::info!("[INFO] {}", event.data.message);
    Ok(())
}

async fn handle_error_event(
    _ctx: Context,
    payload: Vec<u8>,
    _writer: Arc<dyn ResponseWriter>,
) -> wsocket::Result<()> {
    let event: Event = serde_json::from_slice(&payload)?;
    tracing::error!("[ERROR] {}", event.data.message);
    Ok(())
}

fn log_message(ctx: Context, payload: Vec<u8>) -> wsocket::Result<(Context, Vec<u8>)> {
    tracing::info!("received message: {}", String::from_utf8_lossy(&payload));
    Ok((ctx, payload))
}

fn resolver() -> JsonResolver {
    let events = JsonResolver::new("data.type");
    events.add_handler("info", handle_info_event);
    events.add_handler("error", handle_error_event);

    let resolver = JsonResolver::new("type");
    resolver.add_handler("sum-request", handle_sum);
    resolver.add_handler("event", events);
    resolver
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let addr = std::env::var("WSOCKET_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let client = Client::new(resolver(), ClientConfig::default());
    client.add_middleware(log_message);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on ws://{addr}");

    // ── Accept loop ─────────────────────────────────────────────────
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, peer) = accepted?;
                let client = client.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let ws = match tokio_tungstenite::accept_async(tcp).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            tracing::warn!("failed to upgrade connection from {peer}: {e}");
                            return;
                        }
                    };

                    let connection = client.connect(WebSocketTransport::from_stream(ws));
                    connection.wait().await;
                    tracing::info!(
                        "connection from {peer} closed after {:.3} seconds",
                        started.elapsed().as_secs_f64()
                    );
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                client.shutdown();
                break;
            }
        }
    }

    Ok(())
}
