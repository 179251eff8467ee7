//! Integration tests for the connection pipeline.
//!
//! Uses the shared `MockTransport` from `tests/common` to drive a
//! connection from the peer side and verify routing, middleware, the write
//! queue and the connection lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use wsocket::{
    Client, ClientConfig, ConnectionState, Context, JsonResolver, Message, MessageKind,
    ResponseWriter, Result, WsocketError, CLOSE_NORMAL,
};

use common::{init_tracing, wait_closed, MockPeer, MockTransport};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct SumRequest {
    a: i64,
    b: i64,
}

async fn handle_sum(
    _ctx: Context,
    payload: Vec<u8>,
    writer: Arc<dyn ResponseWriter>,
) -> Result<()> {
    let request: SumRequest = serde_json::from_slice(&payload)?;
    let response = format!(
        r#"{{"type": "sum-response", "result": {}}}"#,
        request.a + request.b
    );
    writer.write_message(Message::text(response)).await
}

fn sum_client(config: ClientConfig) -> Client {
    let resolver = JsonResolver::new("type");
    resolver.add_handler("sum-request", handle_sum);
    Client::new(resolver, config)
}

fn open(client: &Client) -> (wsocket::Connection, MockPeer) {
    let (transport, peer) = MockTransport::new();
    (client.connect(transport), peer)
}

/// Wait until `cond` holds, failing the test after a short timeout.
async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(common::WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ════════════════════════════════════════════════════════════════════
// Routing
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sum_request_gets_sum_response() {
    init_tracing();
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    peer.send_text(r#"{"type": "sum-request", "a": 1, "b": 2}"#);

    let written = peer.wait_for_writes(1).await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].kind().unwrap(), MessageKind::Text);
    assert_eq!(written[0].payload(), br#"{"type": "sum-response", "result": 3}"#);
    assert_eq!(connection.state(), ConnectionState::Open);
    assert!(!connection.is_closed());

    peer.hang_up();
    wait_closed(&connection).await;
    assert_eq!(peer.close_count(), 1);
}

#[tokio::test]
async fn nested_resolver_routes_to_inner_handler() {
    let info_calls = Arc::new(AtomicUsize::new(0));
    let error_calls = Arc::new(AtomicUsize::new(0));

    let events = JsonResolver::new("data.type");
    let counter = Arc::clone(&info_calls);
    events.add_handler(
        "info",
        move |_ctx: Context, _payload: Vec<u8>, writer: Arc<dyn ResponseWriter>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { writer.write_message(Message::text("info handled")).await }
        },
    );
    let counter = Arc::clone(&error_calls);
    events.add_handler(
        "error",
        move |_ctx: Context, _payload: Vec<u8>, _writer: Arc<dyn ResponseWriter>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<(), WsocketError>(()) }
        },
    );

    let resolver = JsonResolver::new("type");
    resolver.add_handler("sum-request", handle_sum);
    resolver.add_handler("event", events);

    let client = Client::new(resolver, ClientConfig::default());
    let (_connection, peer) = open(&client);

    let event = serde_json::json!({
        "type": "event",
        "data": { "type": "info", "message": "hello" },
    });
    peer.send_text(&event.to_string());

    peer.wait_for_writes(1).await;
    assert_eq!(peer.written_text(), vec!["info handled"]);
    assert_eq!(info_calls.load(Ordering::SeqCst), 1);
    assert_eq!(error_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn routing_errors_keep_the_connection_alive() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    peer.send_text("not json");
    peer.send_text(r#"[1, 2]"#);
    peer.send_text(r#""sum-request""#);
    peer.send_text(r#"{"kind": "sum-request"}"#);
    peer.send_text(r#"{"type": "unknown"}"#);
    peer.send_text(r#"{"type": "sum-request", "a": "x"}"#);
    peer.send_text(r#"{"type": "sum-request", "a": 20, "b": 22}"#);

    peer.wait_for_writes(1).await;
    assert_eq!(
        peer.written_text(),
        vec![r#"{"type": "sum-response", "result": 42}"#]
    );
    assert_eq!(connection.state(), ConnectionState::Open);
}

// ════════════════════════════════════════════════════════════════════
// Middleware
// ════════════════════════════════════════════════════════════════════

/// Names of the middleware a message passed through, in order.
#[derive(Default)]
struct Trail(Vec<&'static str>);

fn mark(name: &'static str) -> impl wsocket::Middleware {
    move |mut ctx: Context, payload: Vec<u8>| -> Result<(Context, Vec<u8>)> {
        match ctx.get_mut::<Trail>() {
            Some(trail) => trail.0.push(name),
            None => {
                ctx.insert(Trail(vec![name]));
            }
        }
        Ok((ctx, payload))
    }
}

#[tokio::test]
async fn middleware_runs_in_order_on_every_connection() {
    let resolver = JsonResolver::new("type");
    resolver.add_handler(
        "trail",
        |ctx: Context, _payload: Vec<u8>, writer: Arc<dyn ResponseWriter>| async move {
            let trail = ctx.get::<Trail>().map(|t| t.0.join(",")).unwrap_or_default();
            writer.write_message(Message::text(trail)).await
        },
    );
    let client = Client::new(resolver, ClientConfig::default());
    client.add_middleware(mark("m1"));
    client.add_middleware(mark("m2"));
    client.add_middleware(mark("m3"));

    let (_first, first_peer) = open(&client);
    let (_second, second_peer) = open(&client);

    for _ in 0..3 {
        first_peer.send_text(r#"{"type": "trail"}"#);
        second_peer.send_text(r#"{"type": "trail"}"#);
    }

    first_peer.wait_for_writes(3).await;
    second_peer.wait_for_writes(3).await;
    for text in first_peer
        .written_text()
        .into_iter()
        .chain(second_peer.written_text())
    {
        assert_eq!(text, "m1,m2,m3");
    }
}

#[tokio::test]
async fn middleware_error_drops_only_that_message() {
    let client = sum_client(ClientConfig::default());
    client.add_middleware(|ctx: Context, payload: Vec<u8>| -> Result<(Context, Vec<u8>)> {
        if payload.windows(4).any(|w| w == b"drop") {
            return Err(WsocketError::middleware("dropped by filter"));
        }
        Ok((ctx, payload))
    });
    let (connection, peer) = open(&client);

    peer.send_text(r#"{"type": "sum-request", "a": 1, "b": 1, "note": "drop"}"#);
    peer.send_text(r#"{"type": "sum-request", "a": 2, "b": 2}"#);

    peer.wait_for_writes(1).await;
    assert_eq!(
        peer.written_text(),
        vec![r#"{"type": "sum-response", "result": 4}"#]
    );
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test]
async fn middleware_can_rewrite_the_payload() {
    let client = sum_client(ClientConfig::default());
    client.add_middleware(|ctx: Context, _payload: Vec<u8>| -> Result<(Context, Vec<u8>)> {
        Ok((ctx, br#"{"type": "sum-request", "a": 5, "b": 5}"#.to_vec()))
    });
    let (_connection, peer) = open(&client);

    peer.send_text("anything");

    peer.wait_for_writes(1).await;
    assert_eq!(
        peer.written_text(),
        vec![r#"{"type": "sum-response", "result": 10}"#]
    );
}

// ════════════════════════════════════════════════════════════════════
// Write queue
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn zero_kind_is_written_as_text() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    connection
        .write_message(Message::from_raw(0, "zero"))
        .await
        .unwrap();

    let written = peer.wait_for_writes(1).await;
    assert_eq!(written[0], Message::text("zero"));
}

#[tokio::test]
async fn invalid_kind_is_rejected_before_the_queue() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    let err = connection
        .write_message(Message::from_raw(7, "bad"))
        .await
        .unwrap_err();
    assert!(matches!(err, WsocketError::InvalidMessageType(7)));
    assert_eq!(connection.queued(), 0);

    let err = connection
        .try_write_message(Message::from_raw(200, "bad"))
        .unwrap_err();
    assert!(matches!(err, WsocketError::InvalidMessageType(200)));
    assert_eq!(connection.queued(), 0);

    connection.write_message(Message::text("ok")).await.unwrap();
    peer.wait_for_writes(1).await;
    assert_eq!(peer.written_text(), vec!["ok"]);
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test]
async fn writes_preserve_enqueue_order() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    for i in 0..20 {
        connection
            .write_message(Message::text(format!("m{i}")))
            .await
            .unwrap();
    }

    peer.wait_for_writes(20).await;
    let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
    assert_eq!(peer.written_text(), expected);
}

#[tokio::test]
async fn try_write_reports_a_full_queue() {
    let client = sum_client(ClientConfig::default().with_outbound_queue_capacity(1));
    let (transport, peer) = MockTransport::gated();
    let connection = client.connect(transport);

    // The write task takes "a" and blocks inside the transport.
    connection.write_message(Message::text("a")).await.unwrap();
    eventually(|| connection.queued() == 0).await;

    connection.try_write_message(Message::text("b")).unwrap();
    assert_eq!(connection.queued(), 1);
    let err = connection
        .try_write_message(Message::text("c"))
        .unwrap_err();
    assert!(matches!(err, WsocketError::QueueFull));

    peer.release_writes(2);
    peer.wait_for_writes(2).await;
    assert_eq!(peer.written_text(), vec!["a", "b"]);
}

#[tokio::test]
async fn unbuffered_write_waits_for_the_write_task() {
    let client = sum_client(ClientConfig::default().with_outbound_queue_capacity(0));
    let (transport, peer) = MockTransport::gated();
    let connection = client.connect(transport);

    // Taken immediately, then blocked inside the transport.
    tokio::time::timeout(common::WAIT, connection.write_message(Message::text("a")))
        .await
        .unwrap()
        .unwrap();

    let second = tokio::spawn({
        let connection = connection.clone();
        async move { connection.write_message(Message::text("b")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished(), "unbuffered write returned before hand-off");

    peer.release_writes(2);
    tokio::time::timeout(common::WAIT, second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    peer.wait_for_writes(2).await;
    assert_eq!(peer.written_text(), vec!["a", "b"]);
}

#[tokio::test]
async fn max_in_flight_one_handles_messages_one_at_a_time() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let resolver = JsonResolver::new("type");
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    resolver.add_handler(
        "slow",
        move |_ctx: Context, _payload: Vec<u8>, writer: Arc<dyn ResponseWriter>| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                writer.write_message(Message::text("done")).await
            }
        },
    );
    let client = Client::new(resolver, ClientConfig::default().with_max_in_flight(1));
    let (_connection, peer) = open(&client);

    for _ in 0..5 {
        peer.send_text(r#"{"type": "slow"}"#);
    }

    peer.wait_for_writes(5).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

// ════════════════════════════════════════════════════════════════════
// Lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn close_sends_normal_closure_and_completes() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closing);
    wait_closed(&connection).await;

    let written = peer.written();
    assert_eq!(written.len(), 1);
    assert_eq!(
        written[0].close_frame(),
        Some((CLOSE_NORMAL, String::new()))
    );
    assert_eq!(peer.close_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(connection.is_closed());
}

#[tokio::test]
async fn close_flushes_queued_messages_first() {
    let client = sum_client(ClientConfig::default());
    let (transport, peer) = MockTransport::gated();
    let connection = client.connect(transport);

    connection.try_write_message(Message::text("a")).unwrap();
    connection.try_write_message(Message::text("b")).unwrap();
    connection.close();
    peer.release_writes(3);

    wait_closed(&connection).await;
    let written = peer.written();
    assert_eq!(written.len(), 3);
    assert_eq!(written[0], Message::text("a"));
    assert_eq!(written[1], Message::text("b"));
    assert_eq!(written[2].kind().unwrap(), MessageKind::Close);
}

#[tokio::test]
async fn writes_after_close_are_rejected() {
    let client = sum_client(ClientConfig::default());
    let (connection, _peer) = open(&client);

    connection.close();

    let err = connection
        .write_message(Message::text("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, WsocketError::ConnectionClosed));
    let err = connection
        .try_write_message(Message::text("late"))
        .unwrap_err();
    assert!(matches!(err, WsocketError::ConnectionClosed));

    wait_closed(&connection).await;
    let err = connection
        .write_message(Message::text("later"))
        .await
        .unwrap_err();
    assert!(matches!(err, WsocketError::ConnectionClosed));
}

#[tokio::test]
async fn close_times_out_when_the_peer_is_silent() {
    let client = sum_client(
        ClientConfig::default().with_close_timeout(Duration::from_millis(50)),
    );
    let (connection, peer) = open(&client);
    peer.answer_close.store(false, Ordering::SeqCst);

    let started = Instant::now();
    connection.close();
    wait_closed(&connection).await;

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(peer.close_count(), 1);
}

#[tokio::test]
async fn close_times_out_behind_a_blocked_write() {
    let client = sum_client(
        ClientConfig::default().with_close_timeout(Duration::from_millis(50)),
    );
    let (transport, peer) = MockTransport::gated();
    let connection = client.connect(transport);

    connection.write_message(Message::text("a")).await.unwrap();
    eventually(|| connection.queued() == 0).await;

    let started = Instant::now();
    connection.close();
    wait_closed(&connection).await;

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(peer.close_count(), 1);
    assert!(peer.written().is_empty());
}

#[tokio::test]
async fn shutdown_interrupts_a_blocked_write() {
    // Long enough that only the shutdown can end the connection in time.
    let client = sum_client(
        ClientConfig::default().with_close_timeout(Duration::from_secs(60)),
    );
    let (transport, peer) = MockTransport::gated();
    let connection = client.connect(transport);

    connection.write_message(Message::text("a")).await.unwrap();
    eventually(|| connection.queued() == 0).await;

    client.shutdown();
    wait_closed(&connection).await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(peer.close_count(), 1);
}

#[tokio::test]
async fn shutdown_during_a_blocked_close_completes() {
    let client = sum_client(
        ClientConfig::default().with_close_timeout(Duration::from_secs(60)),
    );
    let (transport, peer) = MockTransport::gated();
    let connection = client.connect(transport);

    connection.write_message(Message::text("a")).await.unwrap();
    eventually(|| connection.queued() == 0).await;
    connection.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connection.state(), ConnectionState::Closing);

    client.shutdown();
    wait_closed(&connection).await;
    assert_eq!(peer.close_count(), 1);
}

#[tokio::test]
async fn unbuffered_writes_succeed_only_when_sent() {
    let client = sum_client(
        ClientConfig::default()
            .with_outbound_queue_capacity(0)
            .with_close_timeout(Duration::from_secs(60)),
    );
    let (transport, peer) = MockTransport::gated();
    let connection = client.connect(transport);

    // "a" blocks in the transport, "b" waits in the hand-off slot and "c"
    // waits for the slot.
    connection.write_message(Message::text("a")).await.unwrap();
    let pending: Vec<_> = ["b", "c"]
        .into_iter()
        .map(|text| {
            let connection = connection.clone();
            tokio::spawn(async move {
                (text, connection.write_message(Message::text(text)).await)
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    connection.close();
    peer.release_writes(16);
    wait_closed(&connection).await;

    let written = peer.written_text();
    assert_eq!(written.first().map(String::as_str), Some("a"));
    for task in pending {
        let (text, result) = tokio::time::timeout(common::WAIT, task)
            .await
            .unwrap()
            .unwrap();
        match result {
            Ok(()) => assert!(written.iter().any(|w| w == text), "{text} acknowledged but never sent"),
            Err(e) => assert!(matches!(e, WsocketError::ConnectionClosed), "{text}: {e}"),
        }
    }
}

#[tokio::test]
async fn close_written_by_a_handler_keeps_the_connection_open() {
    let resolver = JsonResolver::new("type");
    resolver.add_handler(
        "bye",
        |_ctx: Context, _payload: Vec<u8>, writer: Arc<dyn ResponseWriter>| async move {
            writer.write_message(Message::close()).await
        },
    );
    let client = Client::new(resolver, ClientConfig::default());
    let (transport, peer) = MockTransport::new();
    peer.answer_close.store(false, Ordering::SeqCst);
    let connection = client.connect(transport);

    peer.send_text(r#"{"type": "bye"}"#);
    let written = peer.wait_for_writes(1).await;
    assert_eq!(written[0].kind().unwrap(), MessageKind::Close);
    assert_eq!(connection.state(), ConnectionState::Open);

    // The handshake still belongs to close().
    peer.answer_close.store(true, Ordering::SeqCst);
    connection.close();
    wait_closed(&connection).await;
    assert_eq!(peer.written().len(), 2);
}

#[tokio::test]
async fn peer_closure_completes_the_connection() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    peer.hang_up();
    wait_closed(&connection).await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(peer.close_count(), 1);
    // No close frame is sent back for a peer-initiated closure.
    assert!(peer.written().is_empty());
}

#[tokio::test]
async fn read_error_completes_the_connection() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    peer.send_error(WsocketError::TransportReceive("connection reset".into()));
    wait_closed(&connection).await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(peer.close_count(), 1);
}

#[tokio::test]
async fn closed_transport_on_read_completes_the_connection() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    peer.send_error(WsocketError::TransportClosed);
    wait_closed(&connection).await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(peer.close_count(), 1);
    assert!(peer.written().is_empty());
}

#[tokio::test]
async fn abnormal_closure_completes_the_connection() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    peer.send_error(WsocketError::AbnormalClosure {
        code: 1011,
        reason: "server error".into(),
    });
    wait_closed(&connection).await;
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn write_failure_tears_down_the_connection() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);
    peer.fail_writes.store(true, Ordering::SeqCst);

    peer.send_text(r#"{"type": "sum-request", "a": 1, "b": 2}"#);

    wait_closed(&connection).await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(peer.close_count(), 1);
    assert!(peer.written().is_empty());
}

#[tokio::test]
async fn client_shutdown_stops_every_connection() {
    let client = sum_client(ClientConfig::default());
    let (first, first_peer) = open(&client);
    let (second, second_peer) = open(&client);

    client.shutdown();

    wait_closed(&first).await;
    wait_closed(&second).await;
    assert_eq!(first_peer.close_count(), 1);
    assert_eq!(second_peer.close_count(), 1);
    assert!(client.is_shut_down());
}

#[tokio::test]
async fn parent_token_cancels_the_client() {
    let parent = tokio_util::sync::CancellationToken::new();
    let resolver = JsonResolver::new("type");
    let client = Client::with_cancellation(resolver, ClientConfig::default(), parent.child_token());
    let (connection, _peer) = open(&client);

    parent.cancel();
    wait_closed(&connection).await;
    assert!(client.is_shut_down());
}

#[tokio::test]
async fn completion_fires_once_under_racing_shutdowns() {
    let client = sum_client(ClientConfig::default());
    let (connection, peer) = open(&client);

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.wait().await })
        })
        .collect();

    let racers = vec![
        tokio::spawn({
            let connection = connection.clone();
            async move { connection.close() }
        }),
        tokio::spawn({
            let connection = connection.clone();
            async move { connection.close() }
        }),
        tokio::spawn({
            let peer = peer.clone();
            async move { peer.send_error(WsocketError::TransportReceive("reset".into())) }
        }),
        tokio::spawn({
            let peer = peer.clone();
            async move { peer.hang_up() }
        }),
        tokio::spawn({
            let client = client.clone();
            async move { client.shutdown() }
        }),
    ];
    for racer in racers {
        racer.await.unwrap();
    }

    for waiter in waiters {
        tokio::time::timeout(common::WAIT, waiter)
            .await
            .unwrap()
            .unwrap();
    }
    wait_closed(&connection).await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(peer.close_count(), 1);
}

#[tokio::test]
async fn connection_ids_are_unique() {
    let client = sum_client(ClientConfig::default());
    let (first, _first_peer) = open(&client);
    let (second, _second_peer) = open(&client);
    assert_ne!(first.id(), second.id());

    let debug = format!("{first:?}");
    assert!(debug.contains(&first.id().to_string()));
}
