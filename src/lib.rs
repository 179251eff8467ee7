//! # wsocket
//!
//! Per-connection message pipeline over any duplex message socket.
//!
//! Every inbound message runs through an ordered chain of [`Middleware`] and is
//! then routed by a [`Resolver`] to application [`Handler`]s. Handlers answer
//! through a [`ResponseWriter`] bound to the originating [`Connection`], whose
//! single write task serializes all outbound messages.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] for any message socket
//! - **Content-based routing**: [`JsonResolver`] dispatches on a dot-separated
//!   field path and can be nested as a handler of another resolver
//! - **WebSocket built-in**: the default `transport-websocket` feature provides
//!   `WebSocketTransport`
//! - **Graceful lifecycle**: close handshake, cancellation, and a completion
//!   signal that fires exactly once
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wsocket::{Client, ClientConfig, Context, JsonResolver, Message, ResponseWriter};
//!
//! async fn pong(_ctx: Context, _payload: Vec<u8>, writer: Arc<dyn ResponseWriter>) -> wsocket::Result<()> {
//!     writer.write_message(Message::text(r#"{"type":"pong"}"#)).await
//! }
//!
//! # #[cfg(feature = "transport-websocket")]
//! # async fn run() -> wsocket::Result<()> {
//! let resolver = JsonResolver::new("type");
//! resolver.add_handler("ping", pong);
//!
//! let client = Client::new(resolver, ClientConfig::default());
//! let transport = wsocket::WebSocketTransport::connect("ws://localhost:8080/ws").await?;
//!
//! let connection = client.connect(transport);
//! connection.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod context;
pub mod error;
pub mod handler;
pub mod message;
pub mod middleware;
pub mod resolver;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{Client, ClientConfig};
pub use connection::{Connection, ConnectionState};
pub use context::Context;
pub use error::{BoxError, Result, WsocketError};
pub use handler::{Handler, ResponseWriter};
pub use message::{Message, MessageKind, CLOSE_NORMAL};
pub use middleware::{Middleware, MiddlewareChain};
pub use resolver::{extract_discriminant, FieldPath, JsonResolver, Resolver};
pub use transport::{Transport, TransportReader, TransportWriter};

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
