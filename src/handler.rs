//! Handler and response-writer traits.
//!
//! A [`Handler`] receives the per-message [`Context`], the payload produced
//! by the middleware chain, and a [`ResponseWriter`] bound to the originating
//! connection. It may write zero, one or many responses.
//!
//! Closures and `async fn` items with the matching signature are handlers:
//!
//! ```
//! use std::sync::Arc;
//! use wsocket::{Context, Message, ResponseWriter, Result};
//!
//! async fn pong(_ctx: Context, _payload: Vec<u8>, writer: Arc<dyn ResponseWriter>) -> Result<()> {
//!     writer.write_message(Message::text(r#"{"type":"pong"}"#)).await
//! }
//!
//! let resolver = wsocket::JsonResolver::new("type");
//! resolver.add_handler("ping", pong);
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::message::Message;

/// Capability to write messages back to the connection a payload came from.
///
/// Handlers must not keep the writer past their own return; writes after the
/// connection has started closing fail with
/// [`WsocketError::ConnectionClosed`](crate::WsocketError::ConnectionClosed).
#[async_trait]
pub trait ResponseWriter: Send + Sync {
    /// Validate and enqueue a message for the connection's write task.
    ///
    /// A Close message is sent like any other message and leaves the
    /// connection open; the close handshake belongs to
    /// [`Connection::close`](crate::Connection::close).
    ///
    /// # Errors
    ///
    /// Returns [`WsocketError::InvalidMessageType`](crate::WsocketError::InvalidMessageType)
    /// for an unknown kind, or
    /// [`WsocketError::ConnectionClosed`](crate::WsocketError::ConnectionClosed)
    /// if the connection no longer accepts writes.
    async fn write_message(&self, message: Message) -> Result<()>;
}

/// Application logic invoked for a resolved message.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one message.
    ///
    /// # Errors
    ///
    /// Any error is logged by the dispatcher; the connection keeps running.
    async fn handle(
        &self,
        ctx: Context,
        payload: Vec<u8>,
        writer: Arc<dyn ResponseWriter>,
    ) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context, Vec<u8>, Arc<dyn ResponseWriter>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: Context,
        payload: Vec<u8>,
        writer: Arc<dyn ResponseWriter>,
    ) -> Result<()> {
        (self)(ctx, payload, writer).await
    }
}
