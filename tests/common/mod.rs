#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for wsocket integration tests.
//!
//! Provides a channel-based [`MockTransport`] whose far end is driven by a
//! [`MockPeer`]: the test injects inbound messages and inspects everything
//! the connection wrote.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use wsocket::{
    Message, MessageKind, Result, Transport, TransportReader, TransportWriter, WsocketError,
};

/// How long helpers wait for the connection before failing the test.
pub const WAIT: Duration = Duration::from_secs(2);

type Inbound = Option<Result<Message>>;

// ── MockTransport ───────────────────────────────────────────────────

/// A channel-based mock transport for integration testing.
pub struct MockTransport {
    reader: MockReader,
    writer: MockWriter,
}

/// Test-side handle to the far end of a [`MockTransport`].
#[derive(Clone)]
pub struct MockPeer {
    inbound: mpsc::UnboundedSender<Inbound>,
    /// Every message the connection wrote, in order.
    pub sent: Arc<Mutex<Vec<Message>>>,
    /// Number of `close()` calls on the write half.
    pub closed: Arc<AtomicUsize>,
    /// When set, every `send()` fails.
    pub fail_writes: Arc<AtomicBool>,
    /// When set, the peer answers a Close frame by ending the stream.
    pub answer_close: Arc<AtomicBool>,
    gate: Option<Arc<Semaphore>>,
}

pub struct MockReader {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

pub struct MockWriter {
    peer: MockPeer,
}

impl MockTransport {
    /// A transport whose writes go through immediately.
    pub fn new() -> (Self, MockPeer) {
        Self::build(None)
    }

    /// A transport whose writes block until [`MockPeer::release_writes`]
    /// lets them through.
    pub fn gated() -> (Self, MockPeer) {
        Self::build(Some(Arc::new(Semaphore::new(0))))
    }

    fn build(gate: Option<Arc<Semaphore>>) -> (Self, MockPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = MockPeer {
            inbound: tx,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            answer_close: Arc::new(AtomicBool::new(true)),
            gate,
        };
        let transport = Self {
            reader: MockReader { inbound: rx },
            writer: MockWriter { peer: peer.clone() },
        };
        (transport, peer)
    }
}

impl Transport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn split(self) -> (MockReader, MockWriter) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl TransportReader for MockReader {
    async fn recv(&mut self) -> Option<Result<Message>> {
        // A dropped peer counts as a normal closure.
        self.inbound.recv().await.flatten()
    }
}

#[async_trait]
impl TransportWriter for MockWriter {
    async fn send(&mut self, message: Message) -> Result<()> {
        if let Some(gate) = &self.peer.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.peer.fail_writes.load(Ordering::SeqCst) {
            return Err(WsocketError::TransportSend("broken pipe".into()));
        }
        let is_close = message.kind().ok() == Some(MessageKind::Close);
        self.peer.sent.lock().push(message);
        if is_close && self.peer.answer_close.load(Ordering::SeqCst) {
            let _ = self.peer.inbound.send(None);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.peer.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── MockPeer ────────────────────────────────────────────────────────

impl MockPeer {
    /// Deliver a text message to the connection. Ignored once the read
    /// task has exited.
    pub fn send_text(&self, text: &str) {
        let _ = self.inbound.send(Some(Ok(Message::text(text))));
    }

    /// Deliver a transport error to the connection.
    pub fn send_error(&self, err: WsocketError) {
        let _ = self.inbound.send(Some(Err(err)));
    }

    /// End the stream as a normal closure.
    pub fn hang_up(&self) {
        let _ = self.inbound.send(None);
    }

    /// Let `n` gated writes through.
    pub fn release_writes(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Number of `close()` calls observed on the write half.
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of written messages.
    pub fn written(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Payloads of written messages decoded as UTF-8.
    pub fn written_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.kind().ok() != Some(MessageKind::Close))
            .map(|m| String::from_utf8(m.payload().to_vec()).unwrap())
            .collect()
    }

    /// Wait until at least `n` messages have been written.
    pub async fn wait_for_writes(&self, n: usize) -> Vec<Message> {
        tokio::time::timeout(WAIT, async {
            loop {
                if self.sent.lock().len() >= n {
                    return self.written();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n} writes"))
    }
}

/// Wait for a connection's completion signal, failing the test on timeout.
pub async fn wait_closed(connection: &wsocket::Connection) {
    tokio::time::timeout(WAIT, connection.wait())
        .await
        .expect("connection did not complete in time");
}

/// Install a test subscriber so `RUST_LOG` works while debugging tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
