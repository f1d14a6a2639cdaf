use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

use live_viewer::error::SignalingError;
use live_viewer::media::LoopbackEngine;
use live_viewer::protocol::{event, request};
use live_viewer::signaling::{LinkState, Signaling, SignalingClient, SignalingConfig};
use live_viewer::{ConnectionState, NegotiationOptions, SessionNegotiator, ViewerConfig};

#[derive(Default)]
struct PeerState {
    connections: AtomicUsize,
    queries: Mutex<Vec<HashMap<String, String>>>,
}

/// Minimal signaling peer speaking the tagged JSON frames.
async fn spawn_peer() -> (SocketAddr, Arc<PeerState>) {
    let state = Arc::new(PeerState::default());
    let router = Router::new()
        .route("/signaling", get(ws_handler))
        .with_state(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind signaling peer");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (addr, state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<PeerState>>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.connections.fetch_add(1, Ordering::SeqCst);
    state.queries.lock().push(query);
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let id = frame["id"].clone();
        let name = frame["name"].as_str().unwrap_or_default().to_string();
        if name == "hang-up" {
            let _ = sender.close().await;
            return;
        }
        let (reply, push) = answer(&name, &frame["data"]);
        let response = json!({ "type": "response", "id": id, "data": reply });
        if sender.send(WsMessage::Text(response.to_string())).await.is_err() {
            return;
        }
        if let Some((event, data)) = push {
            let pushed = json!({ "type": "event", "name": event, "data": data });
            if sender.send(WsMessage::Text(pushed.to_string())).await.is_err() {
                return;
            }
        }
    }
}

fn answer(name: &str, data: &Value) -> (Value, Option<(&'static str, Value)>) {
    match name {
        "echo" => (data.clone(), None),
        "reject" => (json!({ "error": "nope" }), None),
        "announce" => (
            json!({}),
            Some((event::PRODUCER_READY, json!({ "producerId": data["producerId"] }))),
        ),
        request::GET_ROUTER_RTP_CAPABILITIES => (
            json!({ "codecs": [{ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }] }),
            None,
        ),
        request::CREATE_CONSUMER_TRANSPORT => (
            json!({
                "id": "t1",
                "iceParameters": {},
                "iceCandidates": [],
                "dtlsParameters": { "role": "auto", "fingerprints": [] },
            }),
            None,
        ),
        request::CONNECT_CONSUMER_TRANSPORT => {
            if data["transportId"] == json!("t1") && data["dtlsParameters"].is_object() {
                (json!({}), None)
            } else {
                (json!({ "error": "unknown transport" }), None)
            }
        }
        // Nobody is live yet; the broadcaster shows up right after the reply.
        request::GET_PRODUCERS => (
            json!([]),
            Some((event::PRODUCER_READY, json!({ "producerId": "p9" }))),
        ),
        request::CONSUME => (
            json!({
                "id": "c1",
                "producerId": data["producerId"],
                "kind": "video",
                "rtpParameters": {},
            }),
            None,
        ),
        request::CONSUMER_RESUME => (json!({}), None),
        other => (json!({ "error": format!("unknown request {other}") }), None),
    }
}

/// Routes `tracing` output through the test harness so it shows up only for
/// failing tests. Filter with `RUST_LOG`.
fn capture_logs() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn client_for(addr: SocketAddr) -> SignalingClient {
    let config = ViewerConfig {
        url: format!("http://{addr}"),
        stream: Some("lecture-7".into()),
        reconnect_delay: Duration::from_millis(20),
        ..ViewerConfig::default()
    };
    SignalingClient::new(config.signaling_config().expect("signaling config"))
}

#[test_timeout::tokio_timeout_test(10)]
async fn requests_are_answered_and_rejections_surface() {
    capture_logs();
    let (addr, state) = spawn_peer().await;
    let client = client_for(addr);

    client.connect().await.expect("connect");
    client.connect().await.expect("second connect is a no-op");
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);
    assert_eq!(client.link_state(), LinkState::Connected);

    let query = state.queries.lock()[0].clone();
    assert_eq!(query.get("transport").map(String::as_str), Some("websocket"));
    assert_eq!(query.get("stream").map(String::as_str), Some("lecture-7"));

    let (first, second) = tokio::join!(
        client.request("echo", json!({ "n": 1 })),
        client.request("echo", json!({ "n": 2 })),
    );
    assert_eq!(first.expect("first"), json!({ "n": 1 }));
    assert_eq!(second.expect("second"), json!({ "n": 2 }));

    match client.request("reject", Value::Null).await {
        Err(SignalingError::Rejected { request, message }) => {
            assert_eq!(request, "reject");
            assert_eq!(message, "nope");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    client.disconnect().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn pushed_events_reach_subscribers() {
    capture_logs();
    let (addr, _state) = spawn_peer().await;
    let client = client_for(addr);
    client.connect().await.expect("connect");

    let mut ready = client.subscribe(event::PRODUCER_READY);
    let mut closed = client.subscribe(event::PRODUCER_CLOSED);
    client
        .request("announce", json!({ "producerId": "p3" }))
        .await
        .expect("announce");

    assert_eq!(ready.recv().await, Some(json!({ "producerId": "p3" })));
    assert!(closed.try_recv().is_none());

    drop(ready);
    client.disconnect().await;
    assert_eq!(closed.recv().await, None);
}

#[test_timeout::tokio_timeout_test(10)]
async fn dropped_socket_fails_pending_and_reconnects() {
    capture_logs();
    let (addr, state) = spawn_peer().await;
    let client = client_for(addr);
    let mut lifecycle = client.subscribe(event::DISCONNECT);
    client.connect().await.expect("connect");

    let err = client
        .request("hang-up", Value::Null)
        .await
        .expect_err("socket closed before replying");
    assert!(matches!(err, SignalingError::Disconnected));
    assert!(lifecycle.recv().await.is_some());

    let mut link = client.link();
    link.wait_for(LinkState::is_connected)
        .await
        .expect("link alive");
    assert_eq!(state.connections.load(Ordering::SeqCst), 2);
    assert_eq!(
        client.request("echo", json!("again")).await.expect("echo"),
        json!("again")
    );
    client.disconnect().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn exhausted_reconnects_are_terminal() {
    capture_logs();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut config = SignalingConfig::new(
        url::Url::parse(&format!("ws://{addr}/signaling")).expect("url"),
    );
    config.reconnect_attempts = 2;
    config.reconnect_delay = Duration::from_millis(10);
    let client = SignalingClient::new(config);
    let mut errors = client.subscribe(event::CONNECT_ERROR);

    let err = client.connect().await.expect_err("nobody listening");
    assert!(matches!(err, SignalingError::Unavailable(_)));
    assert!(matches!(client.link_state(), LinkState::Failed(_)));

    let mut terminal = Vec::new();
    while let Some(payload) = errors.try_recv() {
        terminal.push(payload["terminal"] == json!(true));
    }
    assert_eq!(terminal, vec![false, false, true]);

    let err = client
        .request("echo", Value::Null)
        .await
        .expect_err("not connected");
    assert!(matches!(err, SignalingError::Unavailable(_)));
}

#[test_timeout::tokio_timeout_test(10)]
async fn disconnect_is_idempotent_and_connect_starts_over() {
    capture_logs();
    let (addr, state) = spawn_peer().await;
    let client = client_for(addr);

    assert!(matches!(
        client.request("echo", Value::Null).await,
        Err(SignalingError::Closed)
    ));

    client.connect().await.expect("connect");
    client.disconnect().await;
    client.disconnect().await;
    assert_eq!(client.link_state(), LinkState::Closed);
    assert!(matches!(
        client.request("echo", Value::Null).await,
        Err(SignalingError::Closed)
    ));

    client.connect().await.expect("reconnect");
    assert_eq!(state.connections.load(Ordering::SeqCst), 2);
    assert_eq!(
        client.request("echo", json!(1)).await.expect("echo"),
        json!(1)
    );
    client.disconnect().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn viewer_session_over_websocket() {
    capture_logs();
    let (addr, _state) = spawn_peer().await;
    let engine = LoopbackEngine::new();
    let negotiator = SessionNegotiator::new(
        Arc::new(client_for(addr)),
        Arc::new(engine.clone()),
        NegotiationOptions::default(),
    );
    let mut snapshots = negotiator.subscribe();

    negotiator.start().await;
    let snapshot = snapshots
        .wait_for(|snapshot| {
            snapshot.state == ConnectionState::Consuming || snapshot.state.is_terminal()
        })
        .await
        .expect("negotiator alive")
        .clone();

    assert_eq!(snapshot.state, ConnectionState::Consuming, "{:?}", snapshot.error);
    let stream = snapshot.stream.expect("stream");
    assert_eq!(stream.producer_id, "p9");
    assert_eq!(stream.consumer_id, "c1");

    negotiator.disconnect().await;
    let stats = engine.stats();
    assert_eq!(stats.consumers_closed, 1);
    assert_eq!(stats.transports_closed, 1);
    assert_eq!(negotiator.snapshot().state, ConnectionState::Disconnected);
}
