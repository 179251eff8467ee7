//! Connection lifecycle: read task, write task and completion signal.
//!
//! [`Connection`] is a cheap, cloneable handle created by
//! [`Client::connect`](crate::Client::connect). Behind it three tasks run
//! for the lifetime of the transport:
//!
//! - the **read task** receives messages and spawns one dispatch task per
//!   message, bounded by the configured in-flight limit;
//! - the **write task** drains the outbound queue into the transport and
//!   releases the transport handle when it exits;
//! - the **supervisor** waits for both and then fires the completion signal
//!   observed through [`Connection::wait`].
//!
//! The state moves `Open → Closing → Closed` and never backwards.
//!
//! # Failure policy
//!
//! Read errors and write errors are both fatal to the whole connection. A
//! failed write cancels the connection's shutdown token, which stops the
//! read task as well, so a connection is never left able to receive but
//! unable to answer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};
use uuid::Uuid;

use crate::client::Pipeline;
use crate::error::{Result, WsocketError};
use crate::handler::ResponseWriter;
use crate::message::{Message, CLOSE_NORMAL};
use crate::transport::{TransportReader, TransportWriter};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Reading and writing.
    Open = 0,
    /// Shutdown has started; new writes are rejected.
    Closing = 1,
    /// Both tasks exited and the transport was released.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Per-connection tuning taken from the client configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionOptions {
    pub(crate) outbound_queue_capacity: usize,
    pub(crate) max_in_flight: usize,
    pub(crate) close_timeout: Duration,
}

/// An item on the outbound queue.
struct Outbound {
    message: Message,
    /// Fired when the write task takes the item off the queue. Only set for
    /// unbuffered connections.
    taken: Option<oneshot::Sender<()>>,
}

/// State shared between the handle and the connection's tasks.
struct Shared {
    id: Uuid,
    state: AtomicU8,
    outbound: mpsc::Sender<Outbound>,
    unbuffered: bool,
    /// Set by [`Connection::close`]; the write task sends the Close frame.
    close_requested: CancellationToken,
    close_timeout: Duration,
    /// When the close handshake gives up. Set once, before
    /// `close_requested` is cancelled; `None` inside means never.
    close_deadline: OnceLock<Option<Instant>>,
    /// Stops both tasks.
    shutdown: CancellationToken,
    /// Completion signal, cancelled once by the supervisor.
    done: CancellationToken,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `Open → Closing`. Returns `true` if this call made the move.
    fn begin_closing(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    fn request_close(&self) {
        let _ = self
            .close_deadline
            .set(Instant::now().checked_add(self.close_timeout));
        self.close_requested.cancel();
    }

    /// Resolves once a requested close has run past its deadline.
    async fn close_expired(&self) {
        self.close_requested.cancelled().await;
        match self.close_deadline.get().copied().flatten() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Handle to a live connection.
///
/// Cloning the handle is cheap; all clones refer to the same connection.
/// Dropping every handle does not close the connection; use
/// [`close`](Connection::close) or cancel the client.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Spawn the read, write and supervisor tasks for a split transport.
    pub(crate) fn spawn<R, W>(
        reader: R,
        writer: W,
        pipeline: Arc<Pipeline>,
        cancel: CancellationToken,
        options: ConnectionOptions,
    ) -> Self
    where
        R: TransportReader,
        W: TransportWriter,
    {
        let unbuffered = options.outbound_queue_capacity == 0;
        // A zero capacity becomes a single hand-off slot plus a `taken`
        // acknowledgement (tokio panics on 0).
        let (outbound, outbound_rx) = mpsc::channel(options.outbound_queue_capacity.max(1));

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            outbound,
            unbuffered,
            close_requested: CancellationToken::new(),
            close_timeout: options.close_timeout,
            close_deadline: OnceLock::new(),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        let connection = Self {
            shared: Arc::clone(&shared),
        };

        let span = tracing::info_span!("connection", id = %shared.id);
        let limiter = Arc::new(Semaphore::new(options.max_in_flight.max(1)));

        let read_task = tokio::spawn(
            read_loop(reader, connection.clone(), pipeline, cancel, limiter)
                .instrument(span.clone()),
        );
        let write_task = tokio::spawn(
            write_loop(writer, outbound_rx, Arc::clone(&shared))
                .instrument(span.clone()),
        );

        tokio::spawn(
            async move {
                if let Err(join_err) = read_task.await {
                    error!("read task terminated abnormally: {join_err}");
                }
                // The write task only exits on shutdown or on its own failure.
                shared.shutdown.cancel();
                if let Err(join_err) = write_task.await {
                    error!("write task terminated abnormally: {join_err}");
                }
                shared.mark_closed();
                shared.done.cancel();
                debug!("connection closed");
            }
            .instrument(span),
        );

        debug!(id = %connection.shared.id, "connection opened");
        connection
    }

    /// Unique id of this connection, also recorded on its tracing span.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns `true` once the completion signal has fired.
    pub fn is_closed(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    /// Number of messages waiting on the outbound queue.
    pub fn queued(&self) -> usize {
        self.shared
            .outbound
            .max_capacity()
            .saturating_sub(self.shared.outbound.capacity())
    }

    /// Validate and enqueue `message` for the write task.
    ///
    /// A kind code of `0` is sent as Text. When the queue is full the call
    /// waits for a free slot; on an unbuffered connection it waits until the
    /// write task has taken the message.
    ///
    /// A Close message written here is sent like any other message: the
    /// connection stays [`Open`](ConnectionState::Open) until the peer ends
    /// the stream. Use [`close`](Connection::close) for the handshake.
    ///
    /// # Errors
    ///
    /// - [`WsocketError::InvalidMessageType`] for an unknown kind; nothing is
    ///   enqueued
    /// - [`WsocketError::ConnectionClosed`] once the connection is closing,
    ///   or on an unbuffered connection when the write task dropped the
    ///   message instead of sending it
    pub async fn write_message(&self, message: Message) -> Result<()> {
        let message = message.normalized()?;
        self.ensure_open()?;

        if self.shared.unbuffered {
            let (taken_tx, taken_rx) = oneshot::channel();
            self.shared
                .outbound
                .send(Outbound {
                    message,
                    taken: Some(taken_tx),
                })
                .await
                .map_err(|_| WsocketError::ConnectionClosed)?;
            taken_rx.await.map_err(|_| WsocketError::ConnectionClosed)
        } else {
            self.shared
                .outbound
                .send(Outbound {
                    message,
                    taken: None,
                })
                .await
                .map_err(|_| WsocketError::ConnectionClosed)
        }
    }

    /// Validate and enqueue `message` without waiting.
    ///
    /// On an unbuffered connection the message is placed in the single
    /// hand-off slot without waiting for the write task to take it.
    ///
    /// # Errors
    ///
    /// - [`WsocketError::InvalidMessageType`] for an unknown kind
    /// - [`WsocketError::QueueFull`] if no slot is free
    /// - [`WsocketError::ConnectionClosed`] once the connection is closing
    pub fn try_write_message(&self, message: Message) -> Result<()> {
        let message = message.normalized()?;
        self.ensure_open()?;

        self.shared
            .outbound
            .try_send(Outbound {
                message,
                taken: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WsocketError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => WsocketError::ConnectionClosed,
            })
    }

    /// Start a graceful close.
    ///
    /// Messages already queued are flushed, then a normal-closure Close
    /// frame is sent. The connection finishes when the peer answers the
    /// Close frame. The configured close timeout runs from this call and
    /// bounds the whole handshake, including writes stuck in the transport.
    /// Failures to send the frame are logged, never returned. This call does
    /// not wait; use [`wait`](Connection::wait) for that.
    pub fn close(&self) {
        if self.shared.begin_closing() {
            debug!(id = %self.shared.id, "close requested");
        }
        self.shared.request_close();
    }

    /// Resolves once both tasks have exited and the transport has been
    /// released. Every caller observes the same, single completion.
    pub async fn wait(&self) {
        self.shared.done.cancelled().await;
    }

    fn ensure_open(&self) -> Result<()> {
        match self.shared.state() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(WsocketError::ConnectionClosed)
            }
        }
    }
}

#[async_trait]
impl ResponseWriter for Connection {
    async fn write_message(&self, message: Message) -> Result<()> {
        Connection::write_message(self, message).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish()
    }
}

// ── Read task ───────────────────────────────────────────────────────

/// Receive messages until the peer closes, the transport fails, or the
/// client or connection is cancelled.
async fn read_loop<R: TransportReader>(
    mut reader: R,
    connection: Connection,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    limiter: Arc<Semaphore>,
) {
    let shutdown = connection.shared.shutdown.clone();

    loop {
        let incoming = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("client cancelled, stopping read task");
                break;
            }
            () = shutdown.cancelled() => {
                debug!("connection shutting down, stopping read task");
                break;
            }
            incoming = reader.recv() => incoming,
        };

        let message = match incoming {
            Some(Ok(message)) => message,
            None => {
                debug!("peer closed the connection");
                break;
            }
            Some(Err(e)) if e.is_closed() => {
                debug!("transport already closed");
                break;
            }
            Some(Err(e)) => {
                error!("failed to read message: {e}");
                break;
            }
        };

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = shutdown.cancelled() => break,
            permit = Arc::clone(&limiter).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let writer: Arc<dyn ResponseWriter> = Arc::new(connection.clone());
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(
            async move {
                pipeline.dispatch(message.into_payload(), writer).await;
                drop(permit);
            }
            .in_current_span(),
        );
    }

    if connection.shared.begin_closing() {
        debug!("connection closing");
    }
    shutdown.cancel();
}

// ── Write task ──────────────────────────────────────────────────────

/// Result of one transport write raced against teardown.
enum WriteOutcome {
    Written,
    Failed(WsocketError),
    /// Shutdown or the close deadline fired while the write was pending.
    Interrupted,
}

/// Drain the outbound queue into the transport until shutdown, then
/// release the transport.
async fn write_loop<W: TransportWriter>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
) {
    let mut close_sent = false;

    loop {
        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            () = shared.close_requested.cancelled(), if !close_sent => {
                close_sent = true;
                if !flush_pending(&mut writer, &mut outbound, &shared).await {
                    break;
                }
                match write_raced(&mut writer, Message::close_with(CLOSE_NORMAL, ""), &shared).await {
                    WriteOutcome::Written => debug!("close frame sent, waiting for peer"),
                    WriteOutcome::Failed(e) => {
                        warn!("failed to send close frame: {e}");
                        shared.shutdown.cancel();
                        break;
                    }
                    WriteOutcome::Interrupted => break,
                }
            }
            () = shared.close_expired() => {
                warn!("peer did not answer the close frame within {:?}", shared.close_timeout);
                shared.shutdown.cancel();
                break;
            }
            item = outbound.recv() => {
                let Some(item) = item else { break };
                if close_sent {
                    // Dropping `taken` unsignalled reports the loss to an
                    // unbuffered writer.
                    debug!("dropping message queued after close");
                    continue;
                }
                if !write_item(&mut writer, item, &shared).await {
                    break;
                }
            }
        }
    }

    outbound.close();
    match writer.close().await {
        Ok(()) => {}
        Err(e) if e.is_closed() => {}
        Err(e) => warn!("failed to close transport: {e}"),
    }
    debug!("write task exited");
}

/// Write one queued message. Returns `false` if the write task must stop.
async fn write_item<W: TransportWriter>(
    writer: &mut W,
    item: Outbound,
    shared: &Shared,
) -> bool {
    if let Some(taken) = item.taken {
        let _ = taken.send(());
    }
    match write_raced(writer, item.message, shared).await {
        WriteOutcome::Written => true,
        WriteOutcome::Failed(e) => {
            error!("failed to write message: {e}");
            shared.shutdown.cancel();
            false
        }
        WriteOutcome::Interrupted => false,
    }
}

/// Write every message already on the queue. Returns `false` if the write
/// task must stop.
async fn flush_pending<W: TransportWriter>(
    writer: &mut W,
    outbound: &mut mpsc::Receiver<Outbound>,
    shared: &Shared,
) -> bool {
    while let Ok(item) = outbound.try_recv() {
        if !write_item(writer, item, shared).await {
            return false;
        }
    }
    true
}

/// Send `message`, giving up if the connection shuts down or the close
/// deadline passes first.
async fn write_raced<W: TransportWriter>(
    writer: &mut W,
    message: Message,
    shared: &Shared,
) -> WriteOutcome {
    tokio::select! {
        biased;
        () = shared.shutdown.cancelled() => WriteOutcome::Interrupted,
        result = writer.send(message) => match result {
            Ok(()) => WriteOutcome::Written,
            Err(e) => WriteOutcome::Failed(e),
        },
        () = shared.close_expired() => {
            warn!("close timed out after {:?} with a write pending", shared.close_timeout);
            shared.shutdown.cancel();
            WriteOutcome::Interrupted
        }
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
    use crate::context::Context;
    use crate::resolver::JsonResolver;
    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready};

    /// Reader fed from a channel; a dropped sender ends the stream.
    struct ChannelReader(mpsc::UnboundedReceiver<Result<Message>>);

    #[async_trait]
    impl TransportReader for ChannelReader {
        async fn recv(&mut self) -> Option<Result<Message>> {
            self.0.recv().await
        }
    }

    /// Writer that records every message and close call.
    #[derive(Clone, Default)]
    struct RecordingWriter {
        sent: Arc<Mutex<Vec<Message>>>,
        closes: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl TransportWriter for RecordingWriter {
        async fn send(&mut self, message: Message) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            *self.closes.lock() += 1;
            Ok(())
        }
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            outbound_queue_capacity: 4,
            max_in_flight: 8,
            close_timeout: Duration::from_millis(50),
        }
    }

    fn echo_pipeline() -> Arc<Pipeline> {
        let resolver = JsonResolver::new("type");
        resolver.add_handler(
            "echo",
            |_ctx: Context, payload: Vec<u8>, writer: Arc<dyn ResponseWriter>| async move {
                writer.write_message(Message::text(payload)).await
            },
        );
        Arc::new(Pipeline::new(Arc::new(resolver)))
    }

    fn start() -> (
        Connection,
        mpsc::UnboundedSender<Result<Message>>,
        RecordingWriter,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = RecordingWriter::default();
        let cancel = CancellationToken::new();
        let connection = Connection::spawn(
            ChannelReader(rx),
            writer.clone(),
            echo_pipeline(),
            cancel.clone(),
            options(),
        );
        (connection, tx, writer, cancel)
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[tokio::test]
    async fn begin_closing_only_moves_forward_once() {
        let (connection, _tx, _writer, _cancel) = start();
        assert!(connection.shared.begin_closing());
        assert!(!connection.shared.begin_closing());
        assert_eq!(connection.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn inbound_message_is_dispatched_and_answered() {
        let (connection, tx, writer, _cancel) = start();
        tx.send(Ok(Message::text(r#"{"type":"echo"}"#))).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while writer.sent.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            writer.sent.lock()[0],
            Message::text(r#"{"type":"echo"}"#)
        );
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn wait_stays_pending_until_the_peer_closes() {
        let (connection, tx, writer, _cancel) = start();

        let mut wait = tokio_test::task::spawn(connection.wait());
        assert_pending!(wait.poll());
        tokio::task::yield_now().await;
        assert_pending!(wait.poll());

        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), connection.wait())
            .await
            .unwrap();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
        assert_eq!(*writer.closes.lock(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_a_silent_connection() {
        let (connection, _tx, writer, cancel) = start();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), connection.wait())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(*writer.closes.lock(), 1);
        assert!(writer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn close_without_answer_times_out() {
        let (connection, _tx, writer, _cancel) = start();
        connection.close();
        assert_err!(connection.try_write_message(Message::text("late")));

        tokio::time::timeout(Duration::from_secs(2), connection.wait())
            .await
            .unwrap();
        let sent = writer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].close_frame(), Some((CLOSE_NORMAL, String::new())));
    }

    #[tokio::test]
    async fn queued_counts_pending_messages() {
        let (outbound, mut outbound_rx) = mpsc::channel(4);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            outbound,
            unbuffered: false,
            close_requested: CancellationToken::new(),
            close_timeout: Duration::from_millis(50),
            close_deadline: OnceLock::new(),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        let connection = Connection {
            shared: Arc::clone(&shared),
        };

        assert_ok!(connection.try_write_message(Message::text("a")));
        assert_ok!(connection.try_write_message(Message::from_raw(0, "b")));
        assert_eq!(connection.queued(), 2);

        let mut writer = RecordingWriter::default();
        assert!(flush_pending(&mut writer, &mut outbound_rx, &shared).await);
        assert_eq!(connection.queued(), 0);
        assert_eq!(
            *writer.sent.lock(),
            vec![Message::text("a"), Message::text("b")]
        );
    }

    /// Write half whose sends never complete.
    #[derive(Clone, Default)]
    struct StuckWriter {
        closes: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl TransportWriter for StuckWriter {
        async fn send(&mut self, _message: Message) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            *self.closes.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_deadline_bounds_a_stuck_write() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let writer = StuckWriter::default();
        let connection = Connection::spawn(
            ChannelReader(rx),
            writer.clone(),
            echo_pipeline(),
            CancellationToken::new(),
            options(),
        );
        assert_ok!(connection.try_write_message(Message::text("stuck")));
        tokio::time::timeout(Duration::from_secs(2), async {
            while connection.queued() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        connection.close();
        tokio::time::timeout(Duration::from_secs(2), connection.wait())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(*writer.closes.lock(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stuck_write() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let writer = StuckWriter::default();
        let cancel = CancellationToken::new();
        let connection = Connection::spawn(
            ChannelReader(rx),
            writer.clone(),
            echo_pipeline(),
            cancel.clone(),
            options(),
        );
        assert_ok!(connection.try_write_message(Message::text("stuck")));
        tokio::task::yield_now().await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), connection.wait())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(*writer.closes.lock(), 1);
    }

    #[tokio::test]
    async fn message_queued_after_the_close_frame_is_not_acknowledged() {
        let (outbound, outbound_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            outbound,
            unbuffered: true,
            close_requested: CancellationToken::new(),
            close_timeout: Duration::from_secs(10),
            close_deadline: OnceLock::new(),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        let writer = RecordingWriter::default();
        let task = tokio::spawn(write_loop(
            writer.clone(),
            outbound_rx,
            Arc::clone(&shared),
        ));

        shared.request_close();
        tokio::time::timeout(Duration::from_secs(2), async {
            while writer.sent.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // A writer that passed the open check just before close().
        let (taken_tx, taken_rx) = oneshot::channel();
        shared
            .outbound
            .send(Outbound {
                message: Message::text("late"),
                taken: Some(taken_tx),
            })
            .await
            .unwrap();
        let taken = tokio::time::timeout(Duration::from_secs(2), taken_rx)
            .await
            .unwrap();
        assert!(taken.is_err(), "dropped message was acknowledged");

        shared.shutdown.cancel();
        task.await.unwrap();
        let sent = writer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].close_frame(), Some((CLOSE_NORMAL, String::new())));
        assert_eq!(*writer.closes.lock(), 1);
    }
}
