//! Content-based routing of JSON payloads.
//!
//! [`JsonResolver`] reads a string discriminant at a dot-separated
//! [`FieldPath`] and invokes the [`Handler`] registered for that value. A
//! resolver is itself a handler, so resolvers nest:
//!
//! ```
//! use wsocket::JsonResolver;
//!
//! let events = JsonResolver::new("data.type");
//! // events.add_handler("info", ...);
//!
//! let root = JsonResolver::new("type");
//! root.add_handler("event", events);
//! ```
//!
//! A resolver must never be registered inside itself, directly or
//! transitively; nothing checks for cycles.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::{Result, WsocketError};
use crate::handler::{Handler, ResponseWriter};

/// Routes a payload to the handler responsible for it.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Resolve `payload` and run its handler.
    ///
    /// # Errors
    ///
    /// Returns a resolution error if no handler applies, or the handler's
    /// own error unchanged.
    async fn handle(
        &self,
        ctx: Context,
        payload: Vec<u8>,
        writer: Arc<dyn ResponseWriter>,
    ) -> Result<()>;
}

// ── FieldPath ───────────────────────────────────────────────────────

/// A dot-separated path into nested JSON objects, e.g. `"data.type"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dot-separated path. Segments are taken verbatim; an empty
    /// segment only matches an empty key.
    pub fn new(path: impl Into<String>) -> Self {
        let raw = path.into();
        let segments = raw.split('.').map(str::to_owned).collect();
        Self { raw, segments }
    }

    /// The path as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path segments in walk order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Walk `value` along the path and return the string leaf.
    ///
    /// Returns `None` if a segment is missing, an intermediate value is not
    /// an object, or the leaf is not a string.
    pub fn lookup<'v>(&self, value: &'v Value) -> Option<&'v str> {
        let mut current = value;
        for segment in &self.segments {
            current = current.as_object()?.get(segment)?;
        }
        current.as_str()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

/// Parse `payload` as a JSON object and extract the string discriminant at
/// `path`.
///
/// # Errors
///
/// - [`WsocketError::MalformedPayload`] if `payload` is not a JSON object,
///   including valid JSON with an array, string or number at the root
/// - [`WsocketError::FieldNotFound`] if the path does not end at a string
pub fn extract_discriminant(payload: &[u8], path: &FieldPath) -> Result<String> {
    let object: Map<String, Value> = serde_json::from_slice(payload)?;
    let value = Value::Object(object);
    path.lookup(&value)
        .map(str::to_owned)
        .ok_or_else(|| WsocketError::FieldNotFound {
            path: path.as_str().to_owned(),
        })
}

// ── JsonResolver ────────────────────────────────────────────────────

/// Resolver keyed by a string field of a JSON object payload.
///
/// Registration and lookup may happen concurrently. The handler map is
/// behind a reader/writer lock that is released before the handler runs.
pub struct JsonResolver {
    path: FieldPath,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl JsonResolver {
    /// Create a resolver that dispatches on the field at `path`.
    ///
    /// For example, with path `"type"` the payload
    /// `{"type": "sum-request", "a": 1, "b": 2}` goes to the handler
    /// registered for `"sum-request"`.
    pub fn new(path: impl Into<FieldPath>) -> Self {
        Self {
            path: path.into(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `discriminant`, replacing any earlier one.
    pub fn add_handler(&self, discriminant: impl Into<String>, handler: impl Handler) {
        self.add_shared_handler(discriminant, Arc::new(handler));
    }

    /// Register an already shared handler for `discriminant`.
    pub fn add_shared_handler(&self, discriminant: impl Into<String>, handler: Arc<dyn Handler>) {
        let discriminant = discriminant.into();
        tracing::debug!(path = %self.path, discriminant = %discriminant, "handler registered");
        self.handlers.write().insert(discriminant, handler);
    }

    /// The field path this resolver dispatches on.
    pub fn field_path(&self) -> &FieldPath {
        &self.path
    }

    /// Number of registered discriminants.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    fn lookup(&self, discriminant: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(discriminant).cloned()
    }
}

impl fmt::Debug for JsonResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonResolver")
            .field("path", &self.path.as_str())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[async_trait]
impl Resolver for JsonResolver {
    async fn handle(
        &self,
        ctx: Context,
        payload: Vec<u8>,
        writer: Arc<dyn ResponseWriter>,
    ) -> Result<()> {
        let discriminant = extract_discriminant(&payload, &self.path)?;
        let handler = self
            .lookup(&discriminant)
            .ok_or(WsocketError::UnknownDiscriminant(discriminant))?;
        handler.handle(ctx, payload, writer).await
    }
}

#[async_trait]
impl Handler for JsonResolver {
    async fn handle(
        &self,
        ctx: Context,
        payload: Vec<u8>,
        writer: Arc<dyn ResponseWriter>,
    ) -> Result<()> {
        Resolver::handle(self, ctx, payload, writer).await
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
    use crate::message::{Message, MessageKind};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Response writer that records every written message.
    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl ResponseWriter for RecordingWriter {
        async fn write_message(&self, message: Message) -> Result<()> {
            let message = message.normalized()?;
            self.written.lock().push(message);
            Ok(())
        }
    }

    fn writer() -> (Arc<RecordingWriter>, Arc<dyn ResponseWriter>) {
        let recording = Arc::new(RecordingWriter::default());
        let dyn_writer: Arc<dyn ResponseWriter> = recording.clone();
        (recording, dyn_writer)
    }

    fn typed_resolver() -> JsonResolver {
        let resolver = JsonResolver::new("type");
        resolver.add_handler(
            "type1",
            |_ctx: Context, _payload: Vec<u8>, rw: Arc<dyn ResponseWriter>| async move {
                rw.write_message(Message::text("Handler for type1")).await
            },
        );
        resolver.add_handler(
            "type2",
            |_ctx: Context, _payload: Vec<u8>, rw: Arc<dyn ResponseWriter>| async move {
                rw.write_message(Message::binary("Handler for type2")).await
            },
        );
        resolver.add_handler(
            "type3",
            |_ctx: Context, _payload: Vec<u8>, rw: Arc<dyn ResponseWriter>| async move {
                rw.write_message(Message::close()).await
            },
        );
        resolver
    }

    // ── FieldPath ───────────────────────────────────────────────────

    #[test]
    fn lookup_top_level_and_nested() {
        let value = json!({ "type": "test", "nested": { "field1": "value1" } });
        assert_eq!(FieldPath::new("type").lookup(&value), Some("test"));
        assert_eq!(FieldPath::new("nested.field1").lookup(&value), Some("value1"));
        assert_eq!(FieldPath::new("nonexistent").lookup(&value), None);
    }

    #[test]
    fn lookup_rejects_non_string_leaves() {
        let value = json!({ "n": 1, "b": true, "o": {}, "a": ["x"], "z": null });
        for path in ["n", "b", "o", "a", "z"] {
            assert_eq!(FieldPath::new(path).lookup(&value), None, "path {path}");
        }
    }

    #[test]
    fn lookup_rejects_non_object_intermediates() {
        let value = json!({ "data": "flat", "list": [{ "type": "x" }], "num": 3 });
        assert_eq!(FieldPath::new("data.type").lookup(&value), None);
        assert_eq!(FieldPath::new("list.type").lookup(&value), None);
        assert_eq!(FieldPath::new("num.type").lookup(&value), None);
    }

    #[test]
    fn lookup_on_non_object_root_fails() {
        assert_eq!(FieldPath::new("type").lookup(&json!("type")), None);
        assert_eq!(FieldPath::new("type").lookup(&json!([1, 2])), None);
    }

    #[test]
    fn field_path_segments() {
        let path = FieldPath::from("data.type");
        assert_eq!(path.segments(), &["data".to_string(), "type".to_string()]);
        assert_eq!(path.to_string(), "data.type");
    }

    #[test]
    fn extract_discriminant_classifies_errors() {
        let path = FieldPath::new("type");
        assert_eq!(
            extract_discriminant(br#"{"type":"a"}"#, &path).unwrap(),
            "a"
        );
        assert!(matches!(
            extract_discriminant(b"invalid_json", &path),
            Err(WsocketError::MalformedPayload(_))
        ));
        assert!(matches!(
            extract_discriminant(b"{}", &path),
            Err(WsocketError::FieldNotFound { path }) if path == "type"
        ));
    }

    #[test]
    fn non_object_root_is_malformed() {
        let path = FieldPath::new("type");
        let payloads: [&[u8]; 5] = [b"[1,2]", br#""type""#, b"42", b"null", b"true"];
        for payload in payloads {
            let err = extract_discriminant(payload, &path).unwrap_err();
            assert!(
                matches!(err, WsocketError::MalformedPayload(_)),
                "{:?} gave {err:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    // ── JsonResolver ────────────────────────────────────────────────

    #[tokio::test]
    async fn dispatches_text_binary_and_close() {
        let resolver = typed_resolver();
        let cases = [
            (r#"{"type": "type1"}"#, MessageKind::Text, "Handler for type1"),
            (r#"{"type": "type2"}"#, MessageKind::Binary, "Handler for type2"),
            (r#"{"type": "type3"}"#, MessageKind::Close, ""),
        ];

        for (input, kind, body) in cases {
            let (recording, rw) = writer();
            Resolver::handle(&resolver, Context::new(), input.as_bytes().to_vec(), rw)
                .await
                .unwrap();
            let written = recording.written.lock();
            assert_eq!(written.len(), 1, "input {input}");
            assert_eq!(written[0].kind().unwrap(), kind);
            assert_eq!(written[0].payload(), body.as_bytes());
        }
    }

    #[tokio::test]
    async fn unknown_discriminant_is_an_error() {
        let resolver = typed_resolver();
        let (recording, rw) = writer();
        let err = Resolver::handle(
            &resolver,
            Context::new(),
            br#"{"type": "unknown"}"#.to_vec(),
            rw,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WsocketError::UnknownDiscriminant(ref d) if d == "unknown"));
        assert!(recording.written.lock().is_empty());
    }

    #[tokio::test]
    async fn invalid_json_and_missing_field_are_errors() {
        let resolver = typed_resolver();
        let (_, rw) = writer();
        let err = Resolver::handle(&resolver, Context::new(), b"invalid_json".to_vec(), rw.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, WsocketError::MalformedPayload(_)));

        let err = Resolver::handle(&resolver, Context::new(), b"{}".to_vec(), rw)
            .await
            .unwrap_err();
        assert!(matches!(err, WsocketError::FieldNotFound { .. }));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let resolver = JsonResolver::new("type");
        resolver.add_handler(
            "x",
            |_ctx: Context, _p: Vec<u8>, rw: Arc<dyn ResponseWriter>| async move {
                rw.write_message(Message::text("first")).await
            },
        );
        resolver.add_handler(
            "x",
            |_ctx: Context, _p: Vec<u8>, rw: Arc<dyn ResponseWriter>| async move {
                rw.write_message(Message::text("second")).await
            },
        );
        assert_eq!(resolver.handler_count(), 1);

        let (recording, rw) = writer();
        Resolver::handle(&resolver, Context::new(), br#"{"type":"x"}"#.to_vec(), rw)
            .await
            .unwrap();
        assert_eq!(recording.written.lock()[0].payload(), b"second");
    }

    #[tokio::test]
    async fn handler_error_is_propagated_unchanged() {
        let resolver = JsonResolver::new("type");
        resolver.add_handler(
            "boom",
            |_ctx: Context, _p: Vec<u8>, _rw: Arc<dyn ResponseWriter>| async move {
                Err::<(), _>(WsocketError::handler("exploded"))
            },
        );
        let (_, rw) = writer();
        let err = Resolver::handle(&resolver, Context::new(), br#"{"type":"boom"}"#.to_vec(), rw)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "handler error: exploded");
    }

    #[tokio::test]
    async fn nested_resolver_errors_pass_through() {
        let events = JsonResolver::new("data.type");
        let root = JsonResolver::new("type");
        root.add_handler("event", events);

        let (_, rw) = writer();
        let err = Resolver::handle(
            &root,
            Context::new(),
            br#"{"type":"event","data":{"type":"debug"}}"#.to_vec(),
            rw.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WsocketError::UnknownDiscriminant(ref d) if d == "debug"));

        let err = Resolver::handle(
            &root,
            Context::new(),
            br#"{"type":"event","data":"flat"}"#.to_vec(),
            rw,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WsocketError::FieldNotFound { ref path } if path == "data.type"));
    }

    #[tokio::test]
    async fn handler_receives_context_and_original_payload() {
        #[derive(Debug, PartialEq)]
        struct Tag(&'static str);

        let resolver = JsonResolver::new("type");
        resolver.add_handler(
            "echo",
            |ctx: Context, payload: Vec<u8>, rw: Arc<dyn ResponseWriter>| async move {
                assert_eq!(ctx.get::<Tag>(), Some(&Tag("from-middleware")));
                rw.write_message(Message::text(payload)).await
            },
        );

        let mut ctx = Context::new();
        ctx.insert(Tag("from-middleware"));
        let (recording, rw) = writer();
        let input = br#"{"type":"echo","x":1}"#.to_vec();
        Resolver::handle(&resolver, ctx, input.clone(), rw)
            .await
            .unwrap();
        assert_eq!(recording.written.lock()[0].payload(), input.as_slice());
    }

    #[test]
    fn debug_shows_path_and_count() {
        let resolver = typed_resolver();
        let debug = format!("{resolver:?}");
        assert!(debug.contains("JsonResolver"));
        assert!(debug.contains("\"type\""));
        assert!(debug.contains('3'));
    }
}
