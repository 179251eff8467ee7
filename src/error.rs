//! Error types for the wsocket pipeline.

use thiserror::Error;

/// Boxed application error carried by [`WsocketError::Middleware`] and
/// [`WsocketError::Handler`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while reading, dispatching or writing messages.
#[derive(Debug, Error)]
pub enum WsocketError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport was already closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// The peer closed the connection with a non-normal close code.
    #[error("connection closed abnormally (code {code}): {reason}")]
    AbnormalClosure {
        /// Close code sent by the peer.
        code: u16,
        /// Close reason sent by the peer, possibly empty.
        reason: String,
    },

    /// A message was submitted with a kind outside {Text, Binary, Close}.
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    /// The outbound queue had no free slot.
    #[error("outbound queue is full")]
    QueueFull,

    /// The connection is closing or closed and no longer accepts writes.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The inbound payload is not a JSON object.
    #[error("failed to unmarshal message: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// The discriminant field is missing or is not a string.
    #[error("failed to get field {path:?} from message")]
    FieldNotFound {
        /// Dot-separated path that was looked up.
        path: String,
    },

    /// No handler is registered for the discriminant value.
    #[error("unknown message type {0:?}")]
    UnknownDiscriminant(String),

    /// A middleware rejected the message.
    #[error("middleware error: {0}")]
    Middleware(#[source] BoxError),

    /// An application handler failed.
    #[error("handler error: {0}")]
    Handler(#[source] BoxError),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WsocketError {
    /// Wrap an application error raised by a middleware.
    pub fn middleware(err: impl Into<BoxError>) -> Self {
        Self::Middleware(err.into())
    }

    /// Wrap an application error raised by a handler.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Self::Handler(err.into())
    }

    /// Returns `true` for errors that mean the transport went away cleanly.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }
}

/// A specialized [`Result`] type for wsocket operations.
pub type Result<T> = std::result::Result<T, WsocketError>;
