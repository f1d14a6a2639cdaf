use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use super::transport::ReceiveTransportController;
use super::{Consumer, ConsumerEvent, MediaTrack};
use crate::error::{DescriptorError, SessionError, SessionErrorKind};
use crate::protocol::{
    ConsumeRequest, ConsumerDescriptor, ProducerEvent, ProducerId, ResumeRequest, event,
    parse_producer_list, request,
};
use crate::signaling::{EventSubscription, Signaling, encode, request_within};

/// Result of asking the peer which producers are live.
#[derive(Debug)]
pub enum Discovery {
    /// First listed producer.
    Ready(ProducerId),
    /// Nobody is live yet; the subscription receives `producer-ready`.
    Awaiting(EventSubscription),
}

/// Why a consumed stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    TrackEnded,
    ProducerClosed,
    TransportClosed,
}

struct ActiveConsumer {
    consumer: Box<dyn Consumer>,
    descriptor: ConsumerDescriptor,
    closed: bool,
}

/// Tracks the session's single consumer: creation, resume, end-of-stream
/// notifications and close.
#[derive(Default)]
pub struct ConsumerLifecycleManager {
    active: Option<ActiveConsumer>,
    events: Option<mpsc::UnboundedReceiver<ConsumerEvent>>,
    producer_closed: Option<EventSubscription>,
}

impl ConsumerLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists active producers. The `producer-ready` subscription is opened
    /// before the request so an announcement racing an empty reply is kept.
    pub async fn discover(
        signaling: &dyn Signaling,
        limit: Option<Duration>,
    ) -> Result<Discovery, SessionError> {
        let ready = signaling.subscribe(event::PRODUCER_READY);
        let listed = request_within(signaling, request::GET_PRODUCERS, Value::Null, limit)
            .await
            .map_err(|err| {
                SessionError::from_signaling(SessionErrorKind::ProducerDiscoveryFailed, err)
            })?;
        let producers = parse_producer_list(listed).map_err(|err| {
            SessionError::caused_by(SessionErrorKind::ProducerDiscoveryFailed, err)
        })?;
        tracing::debug!(target: "media", producers = ?producers, "active producers listed");
        Ok(match producers.into_iter().next() {
            Some(first) => Discovery::Ready(first),
            None => Discovery::Awaiting(ready),
        })
    }

    /// First announced producer wins; later announcements are dropped with
    /// the subscription.
    pub async fn await_producer(
        mut ready: EventSubscription,
        limit: Option<Duration>,
    ) -> Result<ProducerId, SessionError> {
        let first_announcement = async {
            while let Some(payload) = ready.recv().await {
                match ProducerEvent::from_value(&payload) {
                    Some(announced) => return Some(announced.producer_id),
                    None => {
                        tracing::debug!(target: "media", payload = %payload, "malformed producer-ready ignored");
                    }
                }
            }
            None
        };
        let announced = match limit {
            Some(after) => tokio::time::timeout(after, first_announcement)
                .await
                .map_err(|_| {
                    SessionError::new(
                        SessionErrorKind::ProducerWaitTimedOut,
                        format!("nobody went live within {after:?}"),
                    )
                })?,
            None => first_announcement.await,
        };
        announced.ok_or_else(|| {
            SessionError::new(
                SessionErrorKind::SignalingUnavailable,
                "event stream ended while waiting for a broadcaster",
            )
        })
    }

    /// Requests a consumer for `producer_id`, materializes it locally, resumes
    /// it server-side and returns its track.
    pub async fn consume(
        &mut self,
        signaling: &dyn Signaling,
        transport: &ReceiveTransportController,
        producer_id: &str,
        rtp_capabilities: &Value,
        limit: Option<Duration>,
    ) -> Result<MediaTrack, SessionError> {
        self.producer_closed = Some(signaling.subscribe(event::PRODUCER_CLOSED));

        let payload = encode(
            request::CONSUME,
            &ConsumeRequest {
                transport_id: transport.id(),
                producer_id,
                rtp_capabilities,
            },
        )
        .map_err(|err| SessionError::caused_by(SessionErrorKind::ConsumerCreationFailed, err))?;
        let reply = request_within(signaling, request::CONSUME, payload, limit)
            .await
            .map_err(|err| {
                SessionError::from_signaling(SessionErrorKind::ConsumerCreationFailed, err)
            })?;
        let descriptor = ConsumerDescriptor::from_value(reply).map_err(|err| {
            SessionError::caused_by(SessionErrorKind::InvalidConsumerDescriptor, err)
        })?;
        if descriptor.producer_id != producer_id {
            return Err(SessionError::caused_by(
                SessionErrorKind::InvalidConsumerDescriptor,
                DescriptorError::Malformed {
                    descriptor: "consumer descriptor",
                    reason: format!(
                        "producer {} does not match requested {producer_id}",
                        descriptor.producer_id
                    ),
                },
            ));
        }

        self.close();
        let mut consumer = transport.consume(&descriptor).await?;
        self.events = consumer.take_events();
        let consumer_id = descriptor.id.clone();
        tracing::info!(
            target: "media",
            consumer_id = %consumer_id,
            producer_id,
            kind = %descriptor.kind,
            "consumer created"
        );
        self.active = Some(ActiveConsumer {
            consumer,
            descriptor,
            closed: false,
        });

        let payload = encode(
            request::CONSUMER_RESUME,
            &ResumeRequest {
                consumer_id: &consumer_id,
            },
        )
        .map_err(|err| SessionError::caused_by(SessionErrorKind::ConsumerResumeFailed, err))?;
        request_within(signaling, request::CONSUMER_RESUME, payload, limit)
            .await
            .map_err(|err| {
                SessionError::from_signaling(SessionErrorKind::ConsumerResumeFailed, err)
            })?;

        let track = self
            .active
            .as_ref()
            .and_then(|active| active.consumer.track())
            .ok_or_else(|| {
                SessionError::new(
                    SessionErrorKind::NoTrackOnConsumer,
                    format!("consumer {consumer_id} has no track"),
                )
            })?;
        tracing::info!(target: "media", consumer_id = %consumer_id, track_id = %track.id, "consumer resumed");
        Ok(track)
    }

    /// Hands out the end-of-stream notifications for the active consumer.
    pub fn watch(&mut self) -> Option<ConsumerWatch> {
        let active = self.active.as_ref()?;
        Some(ConsumerWatch {
            producer_id: active.descriptor.producer_id.clone(),
            events: self.events.take(),
            producer_closed: self.producer_closed.take(),
        })
    }

    pub fn active_producer(&self) -> Option<&str> {
        self.active
            .as_ref()
            .map(|active| active.descriptor.producer_id.as_str())
    }

    pub fn consumer_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.descriptor.id.as_str())
    }

    /// Drops every notification source still held by the manager.
    pub fn unsubscribe_all(&mut self) {
        self.events = None;
        self.producer_closed = None;
    }

    pub fn close(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.closed {
            return;
        }
        active.closed = true;
        active.consumer.close();
        tracing::info!(target: "media", consumer_id = %active.consumer.id(), "consumer closed");
    }
}

impl Drop for ConsumerLifecycleManager {
    fn drop(&mut self) {
        self.unsubscribe_all();
        self.close();
    }
}

/// End-of-stream sources for one consumed producer.
pub struct ConsumerWatch {
    producer_id: ProducerId,
    events: Option<mpsc::UnboundedReceiver<ConsumerEvent>>,
    producer_closed: Option<EventSubscription>,
}

impl ConsumerWatch {
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Resolves when the track ends, the transport closes underneath the
    /// consumer, or the peer announces `producer-closed` for this producer.
    pub async fn ended(&mut self) -> StreamEnd {
        loop {
            tokio::select! {
                notification = next_event(&mut self.events) => match notification {
                    Some(ConsumerEvent::TrackEnded) => return StreamEnd::TrackEnded,
                    Some(ConsumerEvent::TransportClosed) => return StreamEnd::TransportClosed,
                    None => self.events = None,
                },
                payload = next_payload(&mut self.producer_closed) => match payload {
                    Some(payload) => {
                        let matches = ProducerEvent::from_value(&payload)
                            .is_some_and(|closed| closed.producer_id == self.producer_id);
                        if matches {
                            return StreamEnd::ProducerClosed;
                        }
                    }
                    None => self.producer_closed = None,
                },
            }
        }
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ConsumerEvent>>,
) -> Option<ConsumerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_payload(subscription: &mut Option<EventSubscription>) -> Option<Value> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
