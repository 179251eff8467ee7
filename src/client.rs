//! Client: owns the middleware chain and resolver, and spawns connections.
//!
//! A [`Client`] is a cloneable handle. Every transport handed to
//! [`Client::connect`] becomes a [`Connection`] whose inbound messages run
//! through the shared [`MiddlewareChain`] and [`Resolver`].
//!
//! # Example
//!
//! ```rust,ignore
//! let resolver = JsonResolver::new("type");
//! resolver.add_handler("sum-request", handle_sum);
//!
//! let client = Client::new(resolver, ClientConfig::default());
//! client.add_middleware(log_message);
//!
//! let connection = client.connect(transport);
//! connection.wait().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionOptions};
use crate::context::Context;
use crate::handler::ResponseWriter;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::resolver::Resolver;
use crate::transport::Transport;

/// Default capacity of the per-connection outbound queue.
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 10;

/// Default number of messages dispatched concurrently per connection.
const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Default time to wait for the peer to answer a Close frame.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration applied to every connection a [`Client`] spawns.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wsocket::ClientConfig;
///
/// let config = ClientConfig::default()
///     .with_outbound_queue_capacity(32)
///     .with_max_in_flight(1)
///     .with_close_timeout(Duration::from_millis(250));
/// assert_eq!(config.max_in_flight, 1);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Capacity of each connection's outbound queue.
    ///
    /// When the queue is full, [`Connection::write_message`] waits for a
    /// free slot. A capacity of **0** makes the queue unbuffered: every write
    /// waits until the write task has taken the message.
    ///
    /// Defaults to **10**.
    pub outbound_queue_capacity: usize,
    /// Maximum number of messages from one connection being handled at the
    /// same time. When the limit is reached the read task stops reading
    /// until a handler finishes. A value of 1 handles messages strictly in
    /// arrival order.
    ///
    /// Defaults to **64**. Values below 1 are clamped to 1.
    pub max_in_flight: usize,
    /// How long the close handshake started by [`Connection::close`] may
    /// take before the connection tears itself down.
    ///
    /// Measured from the `close()` call, it covers flushing queued
    /// messages, writing the Close frame and waiting for the peer's answer.
    /// Defaults to **1 second**. A zero timeout tears the connection down
    /// as soon as the Close frame is written, or at once if a write blocks.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Set the outbound queue capacity. `0` means unbuffered.
    #[must_use]
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Set the per-connection in-flight limit. Values below 1 are clamped
    /// to 1.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Set the close handshake timeout.
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_in_flight: self.max_in_flight.max(1),
            close_timeout: self.close_timeout,
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Middleware chain plus resolver, shared by every connection of a client.
pub(crate) struct Pipeline {
    middleware: MiddlewareChain,
    resolver: Arc<dyn Resolver>,
}

impl Pipeline {
    pub(crate) fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            middleware: MiddlewareChain::new(),
            resolver,
        }
    }

    /// Run one inbound payload through the middleware chain and the
    /// resolver. Every failure is logged and contained to this message.
    pub(crate) async fn dispatch(&self, payload: Vec<u8>, writer: Arc<dyn ResponseWriter>) {
        let (ctx, payload) = match self.middleware.run(Context::new(), payload) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to run middlewares: {e}");
                return;
            }
        };

        if let Err(e) = self.resolver.handle(ctx, payload, writer).await {
            warn!("failed to handle message: {e}");
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Factory for [`Connection`]s sharing one middleware chain and resolver.
///
/// All connections spawned by a client (and its clones) live under a single
/// cancellation scope: [`Client::shutdown`] stops every one of them and
/// closes their transports.
#[derive(Clone)]
pub struct Client {
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    config: ClientConfig,
}

impl Client {
    /// Create a client with its own cancellation scope.
    pub fn new(resolver: impl Resolver, config: ClientConfig) -> Self {
        Self::with_cancellation(resolver, config, CancellationToken::new())
    }

    /// Create a client governed by an existing cancellation token, e.g. a
    /// child of an application-wide token.
    pub fn with_cancellation(
        resolver: impl Resolver,
        config: ClientConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(Arc::new(resolver))),
            cancel,
            config,
        }
    }

    /// Append a middleware. Middleware run in the order they were added, for
    /// every connection, including connections that are already open.
    pub fn add_middleware(&self, middleware: impl Middleware) {
        self.pipeline.middleware.push(middleware);
    }

    /// Number of registered middleware.
    pub fn middleware_count(&self) -> usize {
        self.pipeline.middleware.len()
    }

    /// Start serving a connected transport.
    ///
    /// Spawns the connection's tasks on the current tokio runtime and
    /// returns immediately.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn connect(&self, transport: impl Transport) -> Connection {
        let (reader, writer) = transport.split();
        Connection::spawn(
            reader,
            writer,
            Arc::clone(&self.pipeline),
            self.cancel.clone(),
            self.config.connection_options(),
        )
    }

    /// Cancel the client's scope. Every connection stops reading, releases
    /// its transport and fires its completion signal.
    pub fn shutdown(&self) {
        debug!("client shutdown requested");
        self.cancel.cancel();
    }

    /// Returns `true` once [`shutdown`](Client::shutdown) was called or the
    /// governing token was cancelled.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The cancellation token governing this client's connections.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The configuration applied to new connections.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("middleware", &self.middleware_count())
            .field("shut_down", &self.is_shut_down())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::{Result, WsocketError};
    use crate::message::Message;
    use crate::resolver::JsonResolver;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl ResponseWriter for RecordingWriter {
        async fn write_message(&self, message: Message) -> Result<()> {
            self.written.lock().push(message);
            Ok(())
        }
    }

    /// Resolver that echoes the payload it was given.
    struct Echo;

    #[async_trait]
    impl Resolver for Echo {
        async fn handle(
            &self,
            _ctx: Context,
            payload: Vec<u8>,
            writer: Arc<dyn ResponseWriter>,
        ) -> Result<()> {
            writer.write_message(Message::text(payload)).await
        }
    }

    fn pipeline(resolver: impl Resolver) -> Pipeline {
        Pipeline::new(Arc::new(resolver))
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.outbound_queue_capacity, 10);
        assert_eq!(config.max_in_flight, 64);
        assert_eq!(config.close_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_builder_methods() {
        let config = ClientConfig::default()
            .with_outbound_queue_capacity(0)
            .with_max_in_flight(8)
            .with_close_timeout(Duration::from_millis(5));
        assert_eq!(config.outbound_queue_capacity, 0);
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.close_timeout, Duration::from_millis(5));
    }

    #[test]
    fn max_in_flight_is_clamped_to_one() {
        let config = ClientConfig::default().with_max_in_flight(0);
        assert_eq!(config.max_in_flight, 1);

        let raw = ClientConfig {
            max_in_flight: 0,
            ..ClientConfig::default()
        };
        assert_eq!(raw.connection_options().max_in_flight, 1);
    }

    #[tokio::test]
    async fn dispatch_runs_middleware_before_resolver() {
        let pipeline = pipeline(Echo);
        pipeline
            .middleware
            .push(|ctx: Context, mut payload: Vec<u8>| -> Result<(Context, Vec<u8>)> {
                payload.extend_from_slice(b"+m1");
                Ok((ctx, payload))
            });

        let recording = Arc::new(RecordingWriter::default());
        pipeline.dispatch(b"msg".to_vec(), recording.clone()).await;

        let written = recording.written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].payload(), b"msg+m1");
    }

    #[tokio::test]
    async fn middleware_error_drops_the_message() {
        let pipeline = pipeline(Echo);
        pipeline
            .middleware
            .push(|_ctx: Context, _payload: Vec<u8>| -> Result<(Context, Vec<u8>)> {
                Err(WsocketError::middleware("rejected"))
            });

        let recording = Arc::new(RecordingWriter::default());
        pipeline.dispatch(b"msg".to_vec(), recording.clone()).await;
        assert!(recording.written.lock().is_empty());
    }

    #[tokio::test]
    async fn every_message_gets_a_fresh_context() {
        let pipeline = pipeline(Echo);
        pipeline
            .middleware
            .push(|mut ctx: Context, payload: Vec<u8>| -> Result<(Context, Vec<u8>)> {
                assert!(ctx.is_empty(), "context leaked from a previous message");
                ctx.insert(1u8);
                Ok((ctx, payload))
            });

        let recording = Arc::new(RecordingWriter::default());
        pipeline.dispatch(b"a".to_vec(), recording.clone()).await;
        pipeline.dispatch(b"b".to_vec(), recording.clone()).await;
        assert_eq!(recording.written.lock().len(), 2);
    }

    #[tokio::test]
    async fn resolver_error_sends_nothing() {
        let pipeline = pipeline(JsonResolver::new("type"));
        let recording = Arc::new(RecordingWriter::default());
        pipeline
            .dispatch(br#"{"type":"nobody-home"}"#.to_vec(), recording.clone())
            .await;
        assert!(recording.written.lock().is_empty());
    }

    #[test]
    fn add_middleware_counts() {
        let client = Client::new(JsonResolver::new("type"), ClientConfig::default());
        assert_eq!(client.middleware_count(), 0);
        client.add_middleware(|ctx: Context, payload: Vec<u8>| -> Result<(Context, Vec<u8>)> {
            Ok((ctx, payload))
        });
        let clone = client.clone();
        assert_eq!(clone.middleware_count(), 1);
    }

    #[test]
    fn shutdown_cancels_the_scope() {
        let token = CancellationToken::new();
        let client = Client::with_cancellation(
            JsonResolver::new("type"),
            ClientConfig::default(),
            token.child_token(),
        );
        assert!(!client.is_shut_down());
        token.cancel();
        assert!(client.is_shut_down());
        client.shutdown();
        assert!(client.cancellation_token().is_cancelled());
    }

    #[test]
    fn debug_impl_for_client() {
        let client = Client::new(JsonResolver::new("type"), ClientConfig::default());
        let debug = format!("{client:?}");
        assert!(debug.contains("Client"));
        assert!(debug.contains("middleware"));
    }
}
