use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use event_bus::EventBus;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{EventSubscription, LinkState, Signaling};
use crate::error::SignalingError;
use crate::protocol::{ClientFrame, ServerFrame, event, rejection};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ReplySender = oneshot::Sender<Result<Value, SignalingError>>;

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: Url,
    /// Retries after a failed connection attempt before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl SignalingConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

/// WebSocket signaling channel with request/ack correlation, pushed events and
/// bounded automatic reconnection.
pub struct SignalingClient {
    shared: Arc<Shared>,
}

struct Shared {
    config: SignalingConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, ReplySender>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    events: Arc<EventBus<Value>>,
    link_tx: watch::Sender<LinkState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig) -> Self {
        let (link_tx, _) = watch::channel(LinkState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                events: EventBus::new(),
                link_tx,
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.shared.config.url
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.link_tx.borrow().clone()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.supervisor.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Signaling for SignalingClient {
    async fn connect(&self) -> Result<(), SignalingError> {
        let mut link = self.shared.link_tx.subscribe();
        {
            let mut supervisor = self.shared.supervisor.lock();
            let running = supervisor
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());
            if !running {
                self.shared.events.reopen();
                self.shared.link_tx.send_replace(LinkState::Connecting);
                *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.shared))));
            }
        }
        let settled = link
            .wait_for(|state| {
                matches!(
                    state,
                    LinkState::Connected | LinkState::Failed(_) | LinkState::Closed
                )
            })
            .await
            .map_err(|_| SignalingError::Closed)?
            .clone();
        match settled {
            LinkState::Connected => Ok(()),
            LinkState::Failed(reason) => Err(SignalingError::Unavailable(reason)),
            _ => Err(SignalingError::Closed),
        }
    }

    async fn request(&self, name: &str, payload: Value) -> Result<Value, SignalingError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let outbound = self.shared.outbound.lock();
            let Some(sender) = outbound.as_ref() else {
                return Err(self.shared.not_connected());
            };
            self.shared.pending.lock().insert(id, reply_tx);
            let frame = ClientFrame::Request {
                id,
                name: name.to_string(),
                data: payload,
            };
            if sender.send(frame).is_err() {
                self.shared.pending.lock().remove(&id);
                return Err(SignalingError::Disconnected);
            }
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        let data = reply_rx
            .await
            .map_err(|_| SignalingError::Disconnected)??;
        if let Some(message) = rejection(&data) {
            tracing::debug!(target: "signaling", request = name, id, %message, "request rejected");
            return Err(SignalingError::Rejected {
                request: name.to_string(),
                message,
            });
        }
        tracing::trace!(target: "signaling", request = name, id, "reply received");
        Ok(data)
    }

    fn subscribe(&self, event: &str) -> EventSubscription {
        self.shared.events.subscribe(event)
    }

    fn link(&self) -> watch::Receiver<LinkState> {
        self.shared.link_tx.subscribe()
    }

    async fn disconnect(&self) {
        let handle = self.shared.supervisor.lock().take();
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.outbound.lock().take();
        self.shared.fail_pending(|| SignalingError::Closed);
        if was_running {
            self.shared
                .publish_lifecycle(event::DISCONNECT, json!({ "reason": "client disconnect" }));
            tracing::info!(target: "signaling", url = %self.shared.config.url, "signaling disconnected");
        }
        self.shared.events.close();
        self.shared.link_tx.send_replace(LinkState::Closed);
    }
}

/// Drops the correlation entry when a caller stops waiting for its reply.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

impl Shared {
    fn not_connected(&self) -> SignalingError {
        match &*self.link_tx.borrow() {
            LinkState::Closed | LinkState::Idle => SignalingError::Closed,
            LinkState::Failed(reason) => SignalingError::Unavailable(reason.clone()),
            _ => SignalingError::Disconnected,
        }
    }

    fn fail_pending(&self, error: impl Fn() -> SignalingError) {
        let drained: Vec<ReplySender> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for waiter in drained {
            let _ = waiter.send(Err(error()));
        }
    }

    fn publish_lifecycle(&self, name: &str, payload: Value) {
        let _ = self.events.publish(name, payload);
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::Response { id, data }) => {
                let waiter = self.pending.lock().remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(data));
                    }
                    None => {
                        tracing::debug!(target: "signaling", id, "reply for unknown request ignored");
                    }
                }
            }
            Ok(ServerFrame::Event { name, data }) => {
                let delivered = self.events.publish(&name, data).unwrap_or(0);
                tracing::debug!(target: "signaling", event = %name, delivered, "pushed event");
            }
            Err(err) => {
                tracing::debug!(target: "signaling", error = %err, len = text.len(), "undecodable frame ignored");
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>) {
    let url = shared.config.url.clone();
    let mut failures: u32 = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                failures = 0;
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                *shared.outbound.lock() = Some(outbound_tx);
                shared.link_tx.send_replace(LinkState::Connected);
                shared.publish_lifecycle(event::CONNECT, json!({}));
                tracing::info!(target: "signaling", url = %url, "signaling connected");

                let reason = run_connection(&shared, stream, outbound_rx).await;

                shared.outbound.lock().take();
                shared.fail_pending(|| SignalingError::Disconnected);
                shared.publish_lifecycle(event::DISCONNECT, json!({ "reason": reason }));
                tracing::warn!(target: "signaling", url = %url, %reason, "signaling connection dropped");
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(
                    target: "signaling",
                    url = %url,
                    attempt = failures,
                    error = %err,
                    "signaling connect attempt failed"
                );
                if failures > shared.config.reconnect_attempts {
                    let reason = format!("gave up after {failures} attempts: {err}");
                    shared.publish_lifecycle(
                        event::CONNECT_ERROR,
                        json!({ "message": reason, "terminal": true }),
                    );
                    shared.fail_pending(|| SignalingError::Unavailable(reason.clone()));
                    tracing::error!(target: "signaling", url = %url, %reason, "signaling unavailable");
                    shared.link_tx.send_replace(LinkState::Failed(reason));
                    return;
                }
                shared.publish_lifecycle(
                    event::CONNECT_ERROR,
                    json!({ "message": err.to_string(), "terminal": false }),
                );
            }
        }
        shared.link_tx.send_replace(LinkState::Reconnecting {
            attempt: failures + 1,
        });
        tokio::time::sleep(shared.config.reconnect_delay).await;
    }
}

async fn run_connection(
    shared: &Shared,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
) -> String {
    let (mut write, mut read) = stream.split();
    // interval() panics on a zero period.
    let period = shared
        .config
        .heartbeat_interval
        .max(Duration::from_millis(100));
    let mut heartbeat = tokio::time::interval(period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return "outbound channel closed".into();
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target: "signaling", error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    return format!("send failed: {err}");
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => shared.dispatch(&text),
                    Err(_) => {
                        tracing::debug!(target: "signaling", "non-utf8 binary frame ignored");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => format!("closed by peer: {}", frame.reason),
                        None => "closed by peer".into(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return "connection closed".into();
                }
                Some(Err(err)) => return format!("websocket error: {err}"),
                None => return "stream ended".into(),
            },
            _ = heartbeat.tick() => {
                if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                    return format!("heartbeat failed: {err}");
                }
            }
        }
    }
}
