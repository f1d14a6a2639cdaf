//! The viewer session: sequences signaling and the media library into one
//! consumed track and publishes the outcome as [`SessionSnapshot`]s.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{SessionError, SessionErrorKind};
use crate::media::{
    ConsumerLifecycleManager, Discovery, MediaCapabilityAdapter, MediaEngine, MediaTrack,
    ReceiveTransportController, StreamEnd,
};
use crate::protocol::{ProducerId, request};
use crate::signaling::{LinkState, Signaling, request_within};

pub mod state;

pub use state::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationOptions {
    /// Bound on each signaling request and on the library's connect step.
    /// `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Bound on waiting for a broadcaster to go live.
    pub producer_wait: Option<Duration>,
}

impl Default for NegotiationOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(10)),
            producer_wait: None,
        }
    }
}

/// The consumed track, wrapped for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamHandle {
    pub id: Uuid,
    pub track: MediaTrack,
    pub producer_id: ProducerId,
    pub consumer_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub state: ConnectionState,
    pub stream: Option<MediaStreamHandle>,
    pub error: Option<SessionError>,
    pub muted: bool,
}

/// Owns at most one running session. Clones share the session.
#[derive(Clone)]
pub struct SessionNegotiator {
    shared: Arc<Shared>,
    active: Arc<AsyncMutex<Option<ActiveSession>>>,
}

struct Shared {
    signaling: Arc<dyn Signaling>,
    engine: Arc<dyn MediaEngine>,
    options: NegotiationOptions,
    generation: AtomicU64,
    snapshot: watch::Sender<SessionSnapshot>,
}

/// Dropping it drops `cancel`, which makes the task tear down.
struct ActiveSession {
    generation: u64,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SessionNegotiator {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        engine: Arc<dyn MediaEngine>,
        options: NegotiationOptions,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                signaling,
                engine,
                options,
                generation: AtomicU64::new(0),
                snapshot,
            }),
            active: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn options(&self) -> NegotiationOptions {
        self.shared.options
    }

    /// Starts the first session. No-op while a session exists; use
    /// [`reconnect`](Self::reconnect) to leave `Error` or `Closed`.
    pub async fn start(&self) -> u64 {
        let mut active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            return session.generation;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *active = Some(self.launch(generation));
        generation
    }

    /// Tears down whatever is running and starts a brand-new session. Results
    /// still in flight for the superseded session are discarded.
    pub async fn reconnect(&self) -> u64 {
        let mut active = self.active.lock().await;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = active.take() {
            stop(previous).await;
        }
        tracing::info!(target: "viewer", generation, "reconnecting");
        *active = Some(self.launch(generation));
        generation
    }

    /// Releases the session's resources and leaves the state at
    /// `Disconnected`. Repeated calls are no-ops.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            return;
        };
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        stop(previous).await;
        self.shared.reset(generation);
        tracing::info!(target: "viewer", generation, "viewer disconnected");
    }

    /// Mute is a viewer preference and survives reconnects.
    pub fn mute(&self, muted: bool) {
        self.shared.snapshot.send_if_modified(|snapshot| {
            if snapshot.muted == muted {
                return false;
            }
            snapshot.muted = muted;
            true
        });
        tracing::debug!(target: "viewer", muted, "mute changed");
    }

    fn launch(&self, generation: u64) -> ActiveSession {
        self.shared.reset(generation);
        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(run_session(
            Arc::clone(&self.shared),
            generation,
            cancelled,
        ));
        ActiveSession {
            generation,
            cancel,
            task,
        }
    }
}

async fn stop(session: ActiveSession) {
    let ActiveSession {
        generation,
        cancel,
        task,
    } = session;
    let _ = cancel.send(());
    if let Err(err) = task.await {
        tracing::warn!(target: "viewer", generation, error = %err, "session task ended abnormally");
    }
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn reset(&self, generation: u64) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.generation = generation;
            snapshot.state = ConnectionState::Disconnected;
            snapshot.stream = None;
            snapshot.error = None;
        });
    }

    /// Applies a transition for `generation`. Stale generations and edges the
    /// state machine does not declare are dropped.
    fn update(
        &self,
        generation: u64,
        next: ConnectionState,
        apply: impl FnOnce(&mut SessionSnapshot),
    ) -> bool {
        if !self.is_current(generation) {
            tracing::debug!(target: "viewer", generation, state = %next, "stale transition dropped");
            return false;
        }
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.generation != generation {
                tracing::debug!(target: "viewer", generation, state = %next, "stale transition dropped");
                return false;
            }
            let from = snapshot.state;
            if !from.can_transition_to(next) {
                tracing::warn!(target: "viewer", generation, %from, to = %next, "invalid transition rejected");
                return false;
            }
            tracing::info!(target: "viewer", generation, %from, to = %next, "session state changed");
            snapshot.state = next;
            apply(snapshot);
            true
        })
    }

    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        self.update(generation, next, |_| {})
    }

    fn fail(&self, generation: u64, error: SessionError) {
        tracing::error!(
            target: "viewer",
            generation,
            phase = %error.phase(),
            error = %error,
            "session failed"
        );
        self.update(generation, ConnectionState::Error, |snapshot| {
            snapshot.stream = None;
            snapshot.error = Some(error);
        });
    }
}

/// Everything one session acquires, released in a fixed order: handlers,
/// consumer, transport, signaling.
struct SessionResources {
    signaling: Arc<dyn Signaling>,
    signaling_open: bool,
    consumer: ConsumerLifecycleManager,
    transport: Option<ReceiveTransportController>,
}

impl SessionResources {
    fn new(signaling: Arc<dyn Signaling>) -> Self {
        Self {
            signaling,
            signaling_open: false,
            consumer: ConsumerLifecycleManager::new(),
            transport: None,
        }
    }

    async fn release(&mut self, generation: u64) {
        self.consumer.unsubscribe_all();
        self.consumer.close();
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
        if self.signaling_open {
            self.signaling_open = false;
            self.signaling.disconnect().await;
        }
        tracing::debug!(target: "viewer", generation, "session resources released");
    }
}

async fn run_session(shared: Arc<Shared>, generation: u64, cancelled: oneshot::Receiver<()>) {
    let mut resources = SessionResources::new(Arc::clone(&shared.signaling));
    let outcome = tokio::select! {
        outcome = drive(&shared, generation, &mut resources) => Some(outcome),
        _ = cancelled => None,
    };
    resources.release(generation).await;
    match outcome {
        Some(Ok(end)) => {
            tracing::info!(target: "viewer", generation, reason = ?end, "stream ended");
            shared.update(generation, ConnectionState::Closed, |snapshot| {
                snapshot.stream = None;
            });
        }
        Some(Err(error)) => shared.fail(generation, error),
        None => tracing::debug!(target: "viewer", generation, "session cancelled"),
    }
}

async fn drive(
    shared: &Shared,
    generation: u64,
    resources: &mut SessionResources,
) -> Result<StreamEnd, SessionError> {
    let signaling = Arc::clone(&shared.signaling);
    resources.signaling_open = true;
    signaling.connect().await.map_err(|err| {
        SessionError::from_signaling(SessionErrorKind::SignalingUnavailable, err)
    })?;
    shared.transition(generation, ConnectionState::Connecting);

    let link = signaling.link();
    tokio::select! {
        outcome = negotiate(shared, generation, signaling.as_ref(), resources) => outcome,
        reason = link_failure(link, generation) => Err(SessionError::new(
            SessionErrorKind::SignalingUnavailable,
            reason,
        )),
    }
}

/// Resolves once the link the session negotiated over is gone. A drop after
/// `Connected` counts even if the client reconnects: the server releases the
/// session's transport and consumer with the old socket. `Connected` is only
/// published per socket, so seeing it again means the link was replaced.
async fn link_failure(mut link: watch::Receiver<LinkState>, generation: u64) -> String {
    let mut established = false;
    loop {
        let state = link.borrow_and_update().clone();
        match state {
            LinkState::Connected | LinkState::Reconnecting { .. } if established => {
                tracing::warn!(target: "viewer", generation, link = ?state, "signaling link dropped");
                return "signaling link dropped; session state lost on the server".into();
            }
            LinkState::Connected => established = true,
            LinkState::Failed(reason) => return reason,
            LinkState::Closed => return "signaling channel closed".into(),
            _ => {}
        }
        if link.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn negotiate(
    shared: &Shared,
    generation: u64,
    signaling: &dyn Signaling,
    resources: &mut SessionResources,
) -> Result<StreamEnd, SessionError> {
    let limit = shared.options.request_timeout;

    let capabilities = request_within(
        signaling,
        request::GET_ROUTER_RTP_CAPABILITIES,
        Value::Null,
        limit,
    )
    .await
    .map_err(|err| SessionError::from_signaling(SessionErrorKind::InvalidCapabilities, err))?;
    let mut adapter = MediaCapabilityAdapter::new(Arc::clone(&shared.engine));
    let device = adapter.load_capabilities(capabilities).await?;
    shared.transition(generation, ConnectionState::CapabilitiesLoaded);

    let descriptor = request_within(
        signaling,
        request::CREATE_CONSUMER_TRANSPORT,
        Value::Null,
        limit,
    )
    .await
    .map_err(|err| {
        SessionError::from_signaling(SessionErrorKind::InvalidTransportDescriptor, err)
    })?;
    let transport = resources
        .transport
        .insert(ReceiveTransportController::create(device.as_ref(), descriptor)?);
    transport.connect(signaling, limit).await?;
    shared.transition(generation, ConnectionState::TransportReady);

    let producer_id = match ConsumerLifecycleManager::discover(signaling, limit).await? {
        Discovery::Ready(producer_id) => producer_id,
        Discovery::Awaiting(ready) => {
            shared.transition(generation, ConnectionState::AwaitingProducer);
            tracing::info!(target: "viewer", generation, "waiting for a broadcaster");
            ConsumerLifecycleManager::await_producer(ready, shared.options.producer_wait).await?
        }
    };

    let rtp_capabilities = device.rtp_capabilities();
    let track = resources
        .consumer
        .consume(signaling, transport, &producer_id, &rtp_capabilities, limit)
        .await?;
    let consumer_id = resources.consumer.consumer_id().unwrap_or_default().to_string();
    let mut watch = resources.consumer.watch().ok_or_else(|| {
        SessionError::new(
            SessionErrorKind::ConsumerCreationFailed,
            "consumer vanished before it could be watched",
        )
    })?;

    let stream = MediaStreamHandle {
        id: Uuid::new_v4(),
        track,
        producer_id,
        consumer_id,
    };
    tracing::info!(
        target: "viewer",
        generation,
        producer_id = %stream.producer_id,
        consumer_id = %stream.consumer_id,
        "stream available"
    );
    shared.update(generation, ConnectionState::Consuming, |snapshot| {
        snapshot.stream = Some(stream);
    });

    match watch.ended().await {
        StreamEnd::TransportClosed => Err(SessionError::new(
            SessionErrorKind::TransportClosed,
            format!("transport closed under producer {}", watch.producer_id()),
        )),
        end => Ok(end),
    }
}
