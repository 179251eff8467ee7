//! Concrete transport implementations.
//!
//! Each transport sits behind a Cargo feature:
//!
//! | Feature                | Transport              |
//! |------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`] |
//!
//! Any other duplex message socket can be plugged in by implementing
//! [`Transport`](crate::Transport).

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketReader, WebSocketTransport, WebSocketWriter};
