//! In-process media engine. Performs no RTP; it honours the negotiation
//! contract so the handshake can be exercised without a browser stack.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{ConnectRequest, Consumer, ConsumerEvent, Device, MediaEngine, MediaTrack, RecvTransport};
use crate::error::MediaError;
use crate::protocol::{ConsumerDescriptor, MediaKind, RouterCapabilities, TransportDescriptor};

/// Failure injection knobs.
#[derive(Debug, Clone, Default)]
pub struct LoopbackOptions {
    pub reject_device: bool,
    pub fail_consume: bool,
    /// Consumers come up without a track.
    pub omit_track: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub devices_loaded: usize,
    pub transports_created: usize,
    pub transports_closed: usize,
    pub consumers_created: usize,
    pub consumers_closed: usize,
}

#[derive(Clone, Default)]
pub struct LoopbackEngine {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    options: Mutex<LoopbackOptions>,
    stats: Mutex<LoopbackStats>,
    journal: Arc<Mutex<Vec<String>>>,
    consumers: Mutex<HashMap<String, LiveConsumer>>,
}

struct LiveConsumer {
    transport_id: String,
    events: mpsc::UnboundedSender<ConsumerEvent>,
}

impl Inner {
    fn record(&self, entry: String) {
        tracing::trace!(target: "media", %entry, "loopback");
        self.journal.lock().push(entry);
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        let engine = Self::default();
        engine.set_options(options);
        engine
    }

    pub fn set_options(&self, options: LoopbackOptions) {
        *self.inner.options.lock() = options;
    }

    pub fn stats(&self) -> LoopbackStats {
        *self.inner.stats.lock()
    }

    /// Shared, append-only log of close operations in the order they ran.
    pub fn journal(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.inner.journal)
    }

    /// Fires `trackended` on a live consumer. Returns false when it is unknown
    /// or already closed.
    pub fn end_track(&self, consumer_id: &str) -> bool {
        self.notify(consumer_id, ConsumerEvent::TrackEnded)
    }

    /// Fires `transportclose` on a live consumer.
    pub fn close_transport_of(&self, consumer_id: &str) -> bool {
        self.notify(consumer_id, ConsumerEvent::TransportClosed)
    }

    fn notify(&self, consumer_id: &str, event: ConsumerEvent) -> bool {
        self.inner
            .consumers
            .lock()
            .get(consumer_id)
            .is_some_and(|live| live.events.send(event).is_ok())
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn load_device(
        &self,
        capabilities: &RouterCapabilities,
    ) -> Result<Arc<dyn Device>, MediaError> {
        if self.inner.options.lock().reject_device {
            return Err(MediaError::Unsupported(capabilities.mime_types().join(", ")));
        }
        self.inner.stats.lock().devices_loaded += 1;
        Ok(Arc::new(LoopbackDevice {
            inner: Arc::clone(&self.inner),
            rtp_capabilities: json!({
                "codecs": capabilities.codecs,
                "headerExtensions": capabilities.header_extensions,
            }),
        }))
    }
}

struct LoopbackDevice {
    inner: Arc<Inner>,
    rtp_capabilities: Value,
}

impl Device for LoopbackDevice {
    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn create_recv_transport(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Box<dyn RecvTransport>, MediaError> {
        let (request_tx, request_rx) = oneshot::channel();
        let (connect, confirmation) = ConnectRequest::new(json!({
            "role": "client",
            "fingerprints": [{
                "algorithm": "sha-256",
                "value": Uuid::new_v4().simple().to_string(),
            }],
        }));
        let _ = request_tx.send(connect);
        self.inner.stats.lock().transports_created += 1;
        Ok(Box::new(LoopbackTransport {
            id: descriptor.id.clone(),
            inner: Arc::clone(&self.inner),
            connect: Some(request_rx),
            confirmation: Mutex::new(Some(confirmation)),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackTransport {
    id: String,
    inner: Arc<Inner>,
    connect: Option<oneshot::Receiver<ConnectRequest>>,
    confirmation: Mutex<Option<oneshot::Receiver<Result<(), String>>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackTransport {
    fn ensure_connected(&self) -> Result<(), MediaError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut confirmation = self.confirmation.lock();
        let outcome = match confirmation.as_mut() {
            Some(pending) => pending.try_recv(),
            None => return Err(MediaError::Rejected("transport connect was refused".into())),
        };
        match outcome {
            Ok(Ok(())) => {
                confirmation.take();
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(reason)) => {
                confirmation.take();
                Err(MediaError::Rejected(reason))
            }
            Err(oneshot::error::TryRecvError::Empty) => {
                Err(MediaError::Rejected("transport is not connected yet".into()))
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                confirmation.take();
                Err(MediaError::Rejected("transport connect was abandoned".into()))
            }
        }
    }
}

#[async_trait]
impl RecvTransport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn take_connect_request(&mut self) -> Option<oneshot::Receiver<ConnectRequest>> {
        self.connect.take()
    }

    async fn consume(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<Box<dyn Consumer>, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        self.ensure_connected()?;
        let options = self.inner.options.lock().clone();
        if options.fail_consume {
            return Err(MediaError::Rejected(format!(
                "cannot consume producer {}",
                descriptor.producer_id
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.consumers.lock().insert(
            descriptor.id.clone(),
            LiveConsumer {
                transport_id: self.id.clone(),
                events: events_tx,
            },
        );
        self.inner.stats.lock().consumers_created += 1;
        let track = (!options.omit_track).then(|| MediaTrack {
            id: Uuid::new_v4().to_string(),
            kind: descriptor.kind,
        });
        Ok(Box::new(LoopbackConsumer {
            id: descriptor.id.clone(),
            producer_id: descriptor.producer_id.clone(),
            kind: descriptor.kind,
            track,
            events: Some(events_rx),
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Consumers still open on this transport observe `transportclose`.
        for live in self.inner.consumers.lock().values() {
            if live.transport_id == self.id {
                let _ = live.events.send(ConsumerEvent::TransportClosed);
            }
        }
        self.inner.stats.lock().transports_closed += 1;
        self.inner.record(format!("close transport {}", self.id));
    }
}

struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track: Option<MediaTrack>,
    events: Option<mpsc::UnboundedReceiver<ConsumerEvent>>,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl Consumer for LoopbackConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Option<MediaTrack> {
        self.track.clone()
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConsumerEvent>> {
        self.events.take()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.consumers.lock().remove(&self.id);
        self.inner.stats.lock().consumers_closed += 1;
        self.inner.record(format!("close consumer {}", self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> RouterCapabilities {
        RouterCapabilities::from_value(json!({ "codecs": [{ "mimeType": "video/VP8" }] }))
            .expect("caps")
    }

    fn transport_descriptor(id: &str) -> TransportDescriptor {
        TransportDescriptor::from_value(json!({
            "id": id,
            "dtlsParameters": { "role": "auto", "fingerprints": [] },
        }))
        .expect("descriptor")
    }

    fn consumer_descriptor() -> ConsumerDescriptor {
        ConsumerDescriptor::from_value(json!({
            "id": "c1",
            "producerId": "p1",
            "kind": "video",
            "rtpParameters": {},
        }))
        .expect("descriptor")
    }

    #[tokio::test]
    async fn consume_requires_accepted_connect() {
        let engine = LoopbackEngine::new();
        let device = engine.load_device(&caps()).await.expect("device");
        let mut transport = device
            .create_recv_transport(&transport_descriptor("t1"))
            .expect("transport");

        let err = transport.consume(&consumer_descriptor()).await.err();
        assert!(matches!(err, Some(MediaError::Rejected(_))));

        let connect = transport
            .take_connect_request()
            .expect("connect callback")
            .await
            .expect("connect request");
        assert_eq!(connect.dtls_parameters["role"], json!("client"));
        connect.accept();

        let mut consumer = transport
            .consume(&consumer_descriptor())
            .await
            .expect("consumer");
        assert_eq!(consumer.producer_id(), "p1");
        assert_eq!(consumer.kind(), MediaKind::Video);
        assert!(consumer.track().is_some());

        let mut events = consumer.take_events().expect("events");
        assert!(engine.end_track("c1"));
        assert_eq!(events.recv().await, Some(ConsumerEvent::TrackEnded));
    }

    #[tokio::test]
    async fn journal_records_close_order_once() {
        let engine = LoopbackEngine::with_options(LoopbackOptions {
            omit_track: true,
            ..LoopbackOptions::default()
        });
        let device = engine.load_device(&caps()).await.expect("device");
        let mut transport = device
            .create_recv_transport(&transport_descriptor("t1"))
            .expect("transport");
        transport
            .take_connect_request()
            .expect("connect callback")
            .await
            .expect("connect request")
            .accept();
        let consumer = transport
            .consume(&consumer_descriptor())
            .await
            .expect("consumer");
        assert!(consumer.track().is_none());

        consumer.close();
        consumer.close();
        transport.close();
        transport.close();

        assert!(!engine.close_transport_of("c1"));
        assert_eq!(
            *engine.journal().lock(),
            vec!["close consumer c1".to_string(), "close transport t1".to_string()]
        );
        let stats = engine.stats();
        assert_eq!(stats.consumers_created, 1);
        assert_eq!(stats.consumers_closed, 1);
        assert_eq!(stats.transports_closed, 1);
    }
}
