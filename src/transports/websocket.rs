//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketTransport`], a [`Transport`]
//! implementation over a WebSocket connection. It works for both sides of a
//! connection: dial out with [`WebSocketTransport::connect`] (`ws://` and
//! `wss://` through [`MaybeTlsStream`]), or wrap a stream accepted by a
//! server with [`WebSocketTransport::from_stream`].
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> wsocket::Result<()> {
//! use wsocket::{Client, ClientConfig, JsonResolver, WebSocketTransport};
//!
//! let transport = WebSocketTransport::connect("ws://localhost:8080/ws").await?;
//! let client = Client::new(JsonResolver::new("type"), ClientConfig::default());
//!
//! let connection = client.connect(transport);
//! connection.wait().await;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Result, WsocketError};
use crate::message::{Message, MessageKind};
use crate::transport::{Transport, TransportReader, TransportWriter};

/// A [`Transport`] backed by a `tokio-tungstenite` [`WebSocketStream`].
///
/// The stream type defaults to the client-side
/// `MaybeTlsStream<TcpStream>`; server code typically uses
/// `WebSocketTransport<TcpStream>` around the result of
/// [`tokio_tungstenite::accept_async`].
///
/// Ping and pong frames are answered by tungstenite and never surface as
/// messages.
#[derive(Debug)]
pub struct WebSocketTransport<S = MaybeTlsStream<TcpStream>> {
    stream: WebSocketStream<S>,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`WsocketError::Io`] if the URL is invalid or the connection
    /// cannot be established. When the underlying error is an I/O error its
    /// [`ErrorKind`](std::io::ErrorKind) is preserved; all other errors are
    /// mapped to [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::debug!(url = %url, "connecting to WebSocket server");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            WsocketError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!(url = %url, "WebSocket connection established");
        Ok(Self { stream })
    }

    /// Establish a new WebSocket connection with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`WsocketError::Timeout`] if the deadline elapses, or any
    /// error that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(url: &str, timeout: std::time::Duration) -> Result<Self> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| WsocketError::Timeout)?
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-established WebSocket stream, e.g. one accepted by a
    /// server or built with custom TLS settings.
    pub fn from_stream(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = WebSocketReader<S>;
    type Writer = WebSocketWriter<S>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.stream.split();
        (
            WebSocketReader { stream },
            WebSocketWriter {
                sink,
                closed: false,
            },
        )
    }
}

/// Read half of a [`WebSocketTransport`].
///
/// # Cancel Safety
///
/// [`recv`](TransportReader::recv) is cancel-safe: dropping the future
/// before it completes does not lose a message.
#[derive(Debug)]
pub struct WebSocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> TransportReader for WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Option<Result<Message>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(tungstenite::Error::ConnectionClosed)) => return None,
                Some(Err(tungstenite::Error::AlreadyClosed)) => {
                    return Some(Err(WsocketError::TransportClosed));
                }
                Some(Err(e)) => {
                    return Some(Err(WsocketError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                WsMessage::Text(text) => {
                    return Some(Ok(Message::text(text.as_str().as_bytes().to_vec())));
                }
                WsMessage::Binary(bytes) => return Some(Ok(Message::binary(bytes.to_vec()))),
                WsMessage::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return match frame {
                        Some(frame) if frame.code != CloseCode::Normal => {
                            Some(Err(WsocketError::AbnormalClosure {
                                code: u16::from(frame.code),
                                reason: frame.reason.as_str().to_owned(),
                            }))
                        }
                        _ => None,
                    };
                }
                // tungstenite queues the pong reply itself.
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                // Never produced by the read half.
                WsMessage::Frame(_) => {}
            }
        }
    }
}

/// Write half of a [`WebSocketTransport`].
#[derive(Debug)]
pub struct WebSocketWriter<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
    closed: bool,
}

impl<S> WebSocketWriter<S> {
    fn to_frame(message: Message) -> Result<WsMessage> {
        match message.kind()? {
            MessageKind::Text => {
                let text = String::from_utf8(message.into_payload())
                    .map_err(|e| WsocketError::TransportSend(e.to_string()))?;
                Ok(WsMessage::Text(text.into()))
            }
            MessageKind::Binary => Ok(WsMessage::Binary(message.into_payload().into())),
            MessageKind::Close => {
                let frame = message.close_frame().map(|(code, reason)| CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                });
                Ok(WsMessage::Close(frame))
            }
        }
    }
}

#[async_trait]
impl<S> TransportWriter for WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: Message) -> Result<()> {
        if self.closed {
            return Err(WsocketError::TransportClosed);
        }
        let frame = Self::to_frame(message)?;
        self.sink.send(frame).await.map_err(|e| match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                WsocketError::TransportClosed
            }
            other => WsocketError::TransportSend(other.to_string()),
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match SinkExt::close(&mut self.sink).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(WsocketError::TransportSend(e.to_string())),
        }
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::message::CLOSE_NORMAL;
    use tokio::net::TcpListener;

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
        assert_send::<WebSocketReader<TcpStream>>();
        assert_send::<WebSocketWriter<TcpStream>>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, WsocketError::Io(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, WsocketError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        // Non-routable address.
        let err = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            std::time::Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WsocketError::Timeout));
    }

    #[test]
    fn text_frame_conversion() {
        let frame = WebSocketWriter::<TcpStream>::to_frame(Message::text("hi")).unwrap();
        assert_eq!(frame, WsMessage::Text("hi".into()));

        let frame = WebSocketWriter::<TcpStream>::to_frame(Message::from_raw(0, "hi")).unwrap();
        assert_eq!(frame, WsMessage::Text("hi".into()));
    }

    #[test]
    fn invalid_utf8_text_is_rejected() {
        let err = WebSocketWriter::<TcpStream>::to_frame(Message::text(vec![0xff, 0xfe]))
            .unwrap_err();
        assert!(matches!(err, WsocketError::TransportSend(_)));
    }

    #[test]
    fn close_frame_conversion() {
        let frame =
            WebSocketWriter::<TcpStream>::to_frame(Message::close_with(CLOSE_NORMAL, "bye"))
                .unwrap();
        let WsMessage::Close(Some(frame)) = frame else {
            panic!("expected a close frame");
        };
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason.as_str(), "bye");

        let frame = WebSocketWriter::<TcpStream>::to_frame(Message::close()).unwrap();
        assert_eq!(frame, WsMessage::Close(None));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err =
            WebSocketWriter::<TcpStream>::to_frame(Message::from_raw(9, "x")).unwrap_err();
        assert!(matches!(err, WsocketError::InvalidMessageType(9)));
    }

    // ── Mock-server helpers ─────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn recv_receives_text_and_binary() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(WsMessage::Text("hello".into())).await.unwrap();
            ws.send(WsMessage::Binary(vec![0xde, 0xad].into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let (mut reader, _writer) = WebSocketTransport::connect(&url).await.unwrap().split();

        let first = reader.recv().await.unwrap().unwrap();
        assert_eq!(first, Message::text("hello"));

        let second = reader.recv().await.unwrap().unwrap();
        assert_eq!(second, Message::binary(vec![0xde, 0xad]));

        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn normal_close_is_end_of_stream() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let (mut reader, _writer) = WebSocketTransport::connect(&url).await.unwrap().split();
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn abnormal_close_is_an_error() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "go away".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let (mut reader, _writer) = WebSocketTransport::connect(&url).await.unwrap().split();
        let err = reader.recv().await.unwrap().unwrap_err();
        match err {
            WsocketError::AbnormalClosure { code, reason } => {
                assert_eq!(code, 1008);
                assert_eq!(reason, "go away");
            }
            other => panic!("expected AbnormalClosure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_round_trip() {
        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                ws.send(WsMessage::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let (mut reader, mut writer) = WebSocketTransport::connect(&url).await.unwrap().split();
        writer.send(Message::text("ping_echo")).await.unwrap();

        let msg = reader.recv().await.unwrap().unwrap();
        assert_eq!(msg.payload(), b"ping_echo");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let (_reader, mut writer) = WebSocketTransport::connect(&url).await.unwrap().split();
        writer.close().await.unwrap();
        // Second close is a no-op.
        writer.close().await.unwrap();

        let err = writer.send(Message::text("oops")).await.unwrap_err();
        assert!(matches!(err, WsocketError::TransportClosed));
    }

    #[tokio::test]
    async fn from_stream_wraps_accepted_server_side() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let (mut reader, mut writer) = WebSocketTransport::from_stream(ws).split();
            let msg = reader.recv().await.unwrap().unwrap();
            writer.send(msg).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(WsMessage::Text("from_stream_msg".into()))
            .await
            .unwrap();
        let echoed = ws.next().await.unwrap().unwrap();
        assert_eq!(echoed, WsMessage::Text("from_stream_msg".into()));
        server.await.unwrap();
    }
}
