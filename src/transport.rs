//! Transport abstraction for the connection pipeline.
//!
//! A [`Transport`] is a duplex, message-oriented socket. It is split into a
//! [`TransportReader`] and a [`TransportWriter`] when handed to
//! [`Client::connect`](crate::Client::connect) so the read task and the
//! write task of a connection can own their halves independently. Framing,
//! handshakes and TLS are the transport's business.
//!
//! # Connection Setup
//!
//! Connection setup is not part of these traits; different transports have
//! different connection parameters. Construct a connected
//! transport externally, then pass it to the client.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use wsocket::{Message, Result, Transport, TransportReader, TransportWriter};
//!
//! struct MyReader { /* ... */ }
//! struct MyWriter { /* ... */ }
//! struct MyTransport { reader: MyReader, writer: MyWriter }
//!
//! impl Transport for MyTransport {
//!     type Reader = MyReader;
//!     type Writer = MyWriter;
//!
//!     fn split(self) -> (MyReader, MyWriter) {
//!         (self.reader, self.writer)
//!     }
//! }
//!
//! #[async_trait]
//! impl TransportReader for MyReader {
//!     async fn recv(&mut self) -> Option<Result<Message>> {
//!         // Return None when the peer closed the connection normally.
//!         unimplemented!()
//!     }
//! }
//!
//! #[async_trait]
//! impl TransportWriter for MyWriter {
//!     async fn send(&mut self, message: Message) -> Result<()> {
//!         unimplemented!()
//!     }
//!
//!     async fn close(&mut self) -> Result<()> {
//!         unimplemented!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

/// A connected duplex message socket.
pub trait Transport: Send + 'static {
    /// Read half.
    type Reader: TransportReader;
    /// Write half.
    type Writer: TransportWriter;

    /// Split the transport into its read and write halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Read half of a [`Transport`].
///
/// # Cancel Safety
///
/// [`recv`](TransportReader::recv) **MUST** be cancel-safe: the read task
/// races it against cancellation inside `tokio::select!`. Channel- and
/// stream-based implementations are naturally cancel-safe.
#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Receive the next message.
    ///
    /// Returns:
    /// - `Some(Ok(message))`: a complete message was received
    /// - `Some(Err(WsocketError::TransportClosed))`: the transport was already closed
    /// - `Some(Err(e))`: any other transport error; fatal to the connection
    /// - `None`: the peer closed the connection normally
    ///
    /// Close frames are never returned as messages: a normal closure is
    /// reported as `None`.
    ///
    /// [`WsocketError::TransportClosed`]: crate::WsocketError::TransportClosed
    async fn recv(&mut self) -> Option<Result<Message>>;
}

/// Write half of a [`Transport`].
#[async_trait]
pub trait TransportWriter: Send + 'static {
    /// Send one message. The message kind has already been validated.
    ///
    /// # Errors
    ///
    /// Returns [`WsocketError::TransportSend`](crate::WsocketError::TransportSend)
    /// or [`WsocketError::TransportClosed`](crate::WsocketError::TransportClosed)
    /// if the message could not be written.
    async fn send(&mut self, message: Message) -> Result<()>;

    /// Release the underlying handle.
    ///
    /// Implementations should release resources even if a graceful shutdown
    /// fails, and should treat a second call as a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails.
    async fn close(&mut self) -> Result<()>;
}
