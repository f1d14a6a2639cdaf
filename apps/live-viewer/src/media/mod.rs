//! Seam to the WebRTC negotiation library plus the per-session controllers
//! that drive it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{MediaError, SessionError, SessionErrorKind};
use crate::protocol::{ConsumerDescriptor, MediaKind, RouterCapabilities, TransportDescriptor};

pub mod consumer;
pub mod loopback;
pub mod transport;

pub use consumer::{ConsumerLifecycleManager, ConsumerWatch, Discovery, StreamEnd};
pub use loopback::{LoopbackEngine, LoopbackOptions, LoopbackStats};
pub use transport::ReceiveTransportController;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Notifications a library consumer emits after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    TransportClosed,
    TrackEnded,
}

/// The library's "connect" callback: it holds local DTLS parameters and waits
/// for the caller to confirm the remote side accepted them.
pub struct ConnectRequest {
    pub dtls_parameters: Value,
    responder: oneshot::Sender<Result<(), String>>,
}

impl ConnectRequest {
    pub fn new(dtls_parameters: Value) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (responder, confirmation) = oneshot::channel();
        (
            Self {
                dtls_parameters,
                responder,
            },
            confirmation,
        )
    }

    pub fn accept(self) {
        let _ = self.responder.send(Ok(()));
    }

    pub fn reject(self, reason: impl Into<String>) {
        let _ = self.responder.send(Err(reason.into()));
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("dtls_parameters", &self.dtls_parameters)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn load_device(
        &self,
        capabilities: &RouterCapabilities,
    ) -> Result<Arc<dyn Device>, MediaError>;
}

pub trait Device: Send + Sync {
    /// Local RTP capabilities sent along with `consume`.
    fn rtp_capabilities(&self) -> Value;

    fn create_recv_transport(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Box<dyn RecvTransport>, MediaError>;
}

#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Yields the transport's single connect callback; `None` once taken.
    fn take_connect_request(&mut self) -> Option<oneshot::Receiver<ConnectRequest>>;

    async fn consume(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<Box<dyn Consumer>, MediaError>;

    fn close(&self);
}

pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Option<MediaTrack>;

    /// `transportclose` / `trackended` notifications; `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConsumerEvent>>;

    fn close(&self);
}

/// Loads router capabilities into a device, at most once per session.
pub struct MediaCapabilityAdapter {
    engine: Arc<dyn MediaEngine>,
    device: Option<Arc<dyn Device>>,
}

impl MediaCapabilityAdapter {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            device: None,
        }
    }

    pub fn device(&self) -> Option<&Arc<dyn Device>> {
        self.device.as_ref()
    }

    pub async fn load_capabilities(&mut self, raw: Value) -> Result<Arc<dyn Device>, SessionError> {
        if let Some(device) = &self.device {
            return Ok(Arc::clone(device));
        }
        let capabilities = RouterCapabilities::from_value(raw)
            .map_err(|err| SessionError::caused_by(SessionErrorKind::InvalidCapabilities, err))?;
        let device = self
            .engine
            .load_device(&capabilities)
            .await
            .map_err(|err| SessionError::caused_by(SessionErrorKind::InvalidCapabilities, err))?;
        tracing::debug!(
            target: "media",
            codecs = ?capabilities.mime_types(),
            "device loaded router capabilities"
        );
        self.device = Some(Arc::clone(&device));
        Ok(device)
    }
}
