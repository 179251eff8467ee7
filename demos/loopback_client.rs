//! # Loopback Example
//!
//! Runs a sum client against an in-process peer, without any network.
//! Shows how to plug a custom [`Transport`] into a [`Client`]:
//!
//! 1. The transport is a pair of tokio channels
//! 2. The "server" side of the loop answers `sum-request` with `sum-response`
//! 3. The client routes `sum-response` messages to a handler that prints them
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_client
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use wsocket::{
    Client, ClientConfig, Context, JsonResolver, Message, MessageKind, ResponseWriter, Transport,
    TransportReader, TransportWriter, WsocketError,
};

// ── Channel transport ───────────────────────────────────────────────

/// One end of an in-process message pipe.
struct ChannelTransport {
    rx: mpsc::Receiver<Message>,
    tx: mpsc::Sender<Message>,
}

struct ChannelReader(mpsc::Receiver<Message>);

struct ChannelWriter(Option<mpsc::Sender<Message>>);

fn pipe() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::channel(16);
    let (b_tx, b_rx) = mpsc::channel(16);
    (
        ChannelTransport { rx: a_rx, tx: b_tx },
        ChannelTransport { rx: b_rx, tx: a_tx },
    )
}

impl Transport for ChannelTransport {
    type Reader = ChannelReader;
    type Writer = ChannelWriter;

    fn split(self) -> (ChannelReader, ChannelWriter) {
        (ChannelReader(self.rx), ChannelWriter(Some(self.tx)))
    }
}

#[async_trait]
impl TransportReader for ChannelReader {
    async fn recv(&mut self) -> Option<wsocket::Result<Message>> {
        match self.0.recv().await {
            // A close message ends the stream like a normal closure.
            Some(message) if message.kind().ok() == Some(MessageKind::Close) => None,
            Some(message) => Some(Ok(message)),
            None => None,
        }
    }
}

#[async_trait]
impl TransportWriter for ChannelWriter {
    async fn send(&mut self, message: Message) -> wsocket::Result<()> {
        let tx = self.0.as_ref().ok_or(WsocketError::TransportClosed)?;
        tx.send(message)
            .await
            .map_err(|_| WsocketError::TransportClosed)
    }

    async fn close(&mut self) -> wsocket::Result<()> {
        self.0 = None;
        Ok(())
    }
}

// ── Handlers ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SumRequest {
    a: i64,
    b: i64,
}

#[derive(Deserialize)]
struct SumResponse {
    result: i64,
}

async fn handle_sum_request(
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (client_end, server_end) = pipe();

    // ── Server side ─────────────────────────────────────────────────
    let server_resolver = JsonResolver::new("type");
    server_resolver.add_handler("sum-request", handle_sum_request);
    let server = Client::new(server_resolver, ClientConfig::default());
    let server_connection = server.connect(server_end);

    // ── Client side ─────────────────────────────────────────────────
    let (results_tx, mut results) = mpsc::unbounded_channel();
    let client_resolver = JsonResolver::new("type");
    client_resolver.add_handler(
        "sum-response",
        move |_ctx: Context, payload: Vec<u8>, _writer: Arc<dyn ResponseWriter>| {
            let results_tx = results_tx.clone();
            async move {
                let response: SumResponse = serde_json::from_slice(&payload)?;
                let _ = results_tx.send(response.result);
                Ok::<(), WsocketError>(())
            }
        },
    );
    let client = Client::new(client_resolver, ClientConfig::default());
    let connection = client.connect(client_end);

    for (a, b) in [(1, 2), (20, 22), (-5, 5)] {
        connection
            .write_message(Message::text(format!(
                r#"{{"type": "sum-request", "a": {a}, "b": {b}}}"#
            )))
            .await?;
        if let Some(result) = results.recv().await {
            tracing::info!("{a} + {b} = {result}");
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    connection.close();
    connection.wait().await;
    server_connection.wait().await;
    tracing::info!("both ends closed");

    Ok(())
}
