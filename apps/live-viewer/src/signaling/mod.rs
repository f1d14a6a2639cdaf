//! Request/response and push-event access to the signaling peer.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::SignalingError;

pub mod client;

pub use client::{SignalingClient, SignalingConfig};

pub type EventSubscription = event_bus::Subscription<Value>;

/// Health of the duplex channel underneath the request primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted. Terminal until the next `connect()`.
    Failed(String),
    Closed,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

#[async_trait]
pub trait Signaling: Send + Sync {
    /// Opens the channel and resolves once it is usable. No-op when already connected.
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Sends one named request and resolves with its single reply. A reply
    /// carrying an `error` field resolves to [`SignalingError::Rejected`].
    async fn request(&self, name: &str, payload: Value) -> Result<Value, SignalingError>;

    /// Registers for pushed events by name. Dropping the handle unsubscribes.
    fn subscribe(&self, event: &str) -> EventSubscription;

    fn link(&self) -> watch::Receiver<LinkState>;

    /// Tears the channel down and ends every subscription. Idempotent.
    async fn disconnect(&self);
}

pub fn encode<T: Serialize>(request: &str, payload: &T) -> Result<Value, SignalingError> {
    serde_json::to_value(payload).map_err(|source| SignalingError::Encode {
        request: request.to_string(),
        source,
    })
}

/// [`Signaling::request`] bounded by an optional deadline.
pub async fn request_within(
    signaling: &dyn Signaling,
    request: &str,
    payload: Value,
    limit: Option<Duration>,
) -> Result<Value, SignalingError> {
    tracing::debug!(target: "signaling", request, "sending request");
    let call = signaling.request(request, payload);
    match limit {
        Some(after) => tokio::time::timeout(after, call)
            .await
            .map_err(|_| SignalingError::Timeout {
                request: request.to_string(),
                after,
            })?,
        None => call.await,
    }
}
