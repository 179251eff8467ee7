//! Message envelope exchanged with a [`Transport`](crate::Transport).
//!
//! Kind codes follow the RFC 6455 opcodes so they line up with WebSocket
//! frame types. A [`Message`] keeps its raw kind code until it is written:
//! code `0` is treated as [`MessageKind::Text`], and any code outside
//! {Text, Binary, Close} is rejected with
//! [`WsocketError::InvalidMessageType`].

use std::fmt;

use crate::error::{Result, WsocketError};

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Discriminant of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// UTF-8 text payload.
    Text = 1,
    /// Opaque binary payload.
    Binary = 2,
    /// Close frame; the payload is empty or a close code plus reason.
    Close = 8,
}

impl MessageKind {
    /// Wire code of this kind.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = WsocketError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 | 1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            8 => Ok(Self::Close),
            other => Err(WsocketError::InvalidMessageType(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// A message that can be written to, or was read from, a connection.
///
/// Use [`Message::text`], [`Message::binary`] and [`Message::close`] to
/// build well-formed messages. [`Message::from_raw`] accepts any kind code
/// and defers validation to the write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    kind: u8,
    payload: Vec<u8>,
}

impl Message {
    /// Build a text message.
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self::from_raw(MessageKind::Text.code(), payload)
    }

    /// Build a binary message.
    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self::from_raw(MessageKind::Binary.code(), payload)
    }

    /// Build a close message with an empty payload.
    pub fn close() -> Self {
        Self::from_raw(MessageKind::Close.code(), Vec::new())
    }

    /// Build a close message carrying a close code and reason.
    pub fn close_with(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::from_raw(MessageKind::Close.code(), payload)
    }

    /// Build a message from a raw kind code. The code is validated when the
    /// message is written.
    pub fn from_raw(kind: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Raw kind code as supplied at construction.
    pub fn raw_kind(&self) -> u8 {
        self.kind
    }

    /// Resolved kind.
    ///
    /// # Errors
    ///
    /// Returns [`WsocketError::InvalidMessageType`] if the raw code is not
    /// `0`, Text, Binary or Close.
    pub fn kind(&self) -> Result<MessageKind> {
        MessageKind::try_from(self.kind)
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the message and return its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Close code and reason carried by a close message, if any.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        if self.kind().ok()? != MessageKind::Close {
            return None;
        }
        let (code, reason) = self.payload.split_first_chunk::<2>()?;
        Some((
            u16::from_be_bytes(*code),
            String::from_utf8_lossy(reason).into_owned(),
        ))
    }

    /// Validate the kind and rewrite a zero code to Text.
    pub(crate) fn normalized(self) -> Result<Self> {
        let kind = self.kind()?;
        Ok(Self {
            kind: kind.code(),
            payload: self.payload,
        })
    }
}
