use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use super::{ConnectRequest, Consumer, Device, RecvTransport};
use crate::error::{SessionError, SessionErrorKind};
use crate::protocol::{ConnectTransportRequest, ConsumerDescriptor, TransportDescriptor, request};
use crate::signaling::{Signaling, encode, request_within};

/// Owns the session's single receive transport from creation to close.
pub struct ReceiveTransportController {
    transport: Box<dyn RecvTransport>,
    connect: Option<oneshot::Receiver<ConnectRequest>>,
    closed: bool,
}

impl ReceiveTransportController {
    /// Validates the server-issued descriptor before asking the library for a
    /// transport; nothing is retained when validation fails.
    pub fn create(device: &dyn Device, raw: Value) -> Result<Self, SessionError> {
        let descriptor = TransportDescriptor::from_value(raw).map_err(|err| {
            SessionError::caused_by(SessionErrorKind::InvalidTransportDescriptor, err)
        })?;
        let mut transport = device.create_recv_transport(&descriptor).map_err(|err| {
            SessionError::caused_by(SessionErrorKind::InvalidTransportDescriptor, err)
        })?;
        let connect = transport.take_connect_request();
        tracing::info!(target: "media", transport_id = %descriptor.id, "receive transport created");
        Ok(Self {
            transport,
            connect,
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        self.transport.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Forwards the library's local DTLS parameters to the peer and reports
    /// the outcome back through the library's callback.
    pub async fn connect(
        &mut self,
        signaling: &dyn Signaling,
        limit: Option<Duration>,
    ) -> Result<(), SessionError> {
        let pending = self.connect.take().ok_or_else(|| {
            SessionError::new(
                SessionErrorKind::TransportConnectFailed,
                "transport offers no connect step",
            )
        })?;
        let waited = match limit {
            Some(after) => tokio::time::timeout(after, pending).await.map_err(|_| {
                SessionError::new(
                    SessionErrorKind::TransportConnectFailed,
                    format!("no local DTLS parameters after {after:?}"),
                )
            })?,
            None => pending.await,
        };
        let connect = waited.map_err(|_| {
            SessionError::new(
                SessionErrorKind::TransportConnectFailed,
                "transport dropped its connect callback",
            )
        })?;

        let encoded = encode(
            request::CONNECT_CONSUMER_TRANSPORT,
            &ConnectTransportRequest {
                dtls_parameters: &connect.dtls_parameters,
                transport_id: self.transport.id(),
            },
        );
        let payload = match encoded {
            Ok(payload) => payload,
            Err(err) => {
                connect.reject(err.to_string());
                return Err(SessionError::caused_by(
                    SessionErrorKind::TransportConnectFailed,
                    err,
                ));
            }
        };

        match request_within(signaling, request::CONNECT_CONSUMER_TRANSPORT, payload, limit).await {
            Ok(_) => {
                connect.accept();
                tracing::info!(target: "media", transport_id = %self.id(), "receive transport connected");
                Ok(())
            }
            Err(err) => {
                connect.reject(err.to_string());
                Err(SessionError::from_signaling(
                    SessionErrorKind::TransportConnectFailed,
                    err,
                ))
            }
        }
    }

    pub async fn consume(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<Box<dyn Consumer>, SessionError> {
        self.transport.consume(descriptor).await.map_err(|err| {
            SessionError::caused_by(SessionErrorKind::ConsumerCreationFailed, err)
        })
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.transport.close();
        tracing::info!(target: "media", transport_id = %self.id(), "receive transport closed");
    }
}

impl Drop for ReceiveTransportController {
    fn drop(&mut self) {
        self.close();
    }
}
