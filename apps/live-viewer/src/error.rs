use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    /// The peer answered with an `error` field; the message is that field.
    #[error("{message}")]
    Rejected { request: String, message: String },
    #[error("request {request} timed out after {after:?}")]
    Timeout { request: String, after: Duration },
    #[error("signaling connection lost")]
    Disconnected,
    #[error("signaling client closed")]
    Closed,
    #[error("signaling unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode request {request}: {source}")]
    Encode {
        request: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("{0}")]
    Rejected(String),
    #[error("unsupported capabilities: {0}")]
    Unsupported(String),
    #[error("media handle closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("{descriptor} is missing `{field}`")]
    MissingField {
        descriptor: &'static str,
        field: &'static str,
    },
    #[error("{descriptor} is malformed: {reason}")]
    Malformed {
        descriptor: &'static str,
        reason: String,
    },
}

/// Handshake phase a [`SessionError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Signaling,
    Capabilities,
    Transport,
    ProducerDiscovery,
    Consume,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Signaling => "signaling",
            Phase::Capabilities => "capabilities",
            Phase::Transport => "transport",
            Phase::ProducerDiscovery => "producer discovery",
            Phase::Consume => "consume",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
    SignalingUnavailable,
    InvalidCapabilities,
    InvalidTransportDescriptor,
    TransportConnectFailed,
    TransportClosed,
    ProducerDiscoveryFailed,
    ProducerWaitTimedOut,
    InvalidConsumerDescriptor,
    ConsumerCreationFailed,
    ConsumerResumeFailed,
    NoTrackOnConsumer,
}

impl SessionErrorKind {
    pub fn phase(self) -> Phase {
        match self {
            SessionErrorKind::SignalingUnavailable => Phase::Signaling,
            SessionErrorKind::InvalidCapabilities => Phase::Capabilities,
            SessionErrorKind::InvalidTransportDescriptor
            | SessionErrorKind::TransportConnectFailed
            | SessionErrorKind::TransportClosed => Phase::Transport,
            SessionErrorKind::ProducerDiscoveryFailed | SessionErrorKind::ProducerWaitTimedOut => {
                Phase::ProducerDiscovery
            }
            SessionErrorKind::InvalidConsumerDescriptor
            | SessionErrorKind::ConsumerCreationFailed
            | SessionErrorKind::ConsumerResumeFailed
            | SessionErrorKind::NoTrackOnConsumer => Phase::Consume,
        }
    }

    fn summary(self) -> &'static str {
        match self {
            SessionErrorKind::SignalingUnavailable => "signaling server unavailable",
            SessionErrorKind::InvalidCapabilities => "invalid router capabilities",
            SessionErrorKind::InvalidTransportDescriptor => "invalid transport descriptor",
            SessionErrorKind::TransportConnectFailed => "transport connect failed",
            SessionErrorKind::TransportClosed => "media transport closed",
            SessionErrorKind::ProducerDiscoveryFailed => "could not list broadcasters",
            SessionErrorKind::ProducerWaitTimedOut => "no broadcaster went live in time",
            SessionErrorKind::InvalidConsumerDescriptor => "invalid consumer descriptor",
            SessionErrorKind::ConsumerCreationFailed => "consumer creation failed",
            SessionErrorKind::ConsumerResumeFailed => "consumer resume failed",
            SessionErrorKind::NoTrackOnConsumer => "consumer has no media track",
        }
    }
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.summary())
    }
}

/// Terminal failure of one viewer session, tagged with the step that failed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind, detail: impl fmt::Display) -> Self {
        Self {
            kind,
            message: format!("{kind}: {detail}"),
            cause: None,
        }
    }

    /// Builds the error from an underlying failure, which becomes the source.
    pub fn caused_by<E>(kind: SessionErrorKind, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: format!("{kind}: {cause}"),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Failure of the signaling request behind `kind`. A lost or exhausted
    /// channel is reported as [`SessionErrorKind::SignalingUnavailable`].
    pub fn from_signaling(kind: SessionErrorKind, err: SignalingError) -> Self {
        match err {
            SignalingError::Disconnected
            | SignalingError::Closed
            | SignalingError::Unavailable(_) => {
                Self::caused_by(SessionErrorKind::SignalingUnavailable, err)
            }
            other => Self::caused_by(kind, other),
        }
    }

    pub fn phase(&self) -> Phase {
        self.kind.phase()
    }
}

/// The browser-equivalent autoplay policy refused to start playback. Handled
/// by the viewer surface; never a session failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("playback blocked: {reason}")]
pub struct PlaybackBlocked {
    pub reason: String,
}

impl PlaybackBlocked {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn kinds_map_to_phases() {
        assert_eq!(
            SessionErrorKind::ConsumerResumeFailed.phase(),
            Phase::Consume
        );
        assert_eq!(
            SessionErrorKind::TransportConnectFailed.phase(),
            Phase::Transport
        );
        assert_eq!(
            SessionErrorKind::ProducerWaitTimedOut.phase(),
            Phase::ProducerDiscovery
        );
    }

    #[test]
    fn caused_by_keeps_source_and_message() {
        let err = SessionError::caused_by(
            SessionErrorKind::ConsumerResumeFailed,
            SignalingError::Rejected {
                request: "consumer-resume".into(),
                message: "consumer not found".into(),
            },
        );
        assert_eq!(err.to_string(), "consumer resume failed: consumer not found");
        assert_eq!(err.phase(), Phase::Consume);
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "consumer not found");
    }

    #[test]
    fn lost_channel_is_reported_as_signaling_unavailable() {
        let err = SessionError::from_signaling(
            SessionErrorKind::InvalidCapabilities,
            SignalingError::Disconnected,
        );
        assert_eq!(err.kind, SessionErrorKind::SignalingUnavailable);

        let err = SessionError::from_signaling(
            SessionErrorKind::TransportConnectFailed,
            SignalingError::Timeout {
                request: "connect-consumer-transport".into(),
                after: Duration::from_secs(10),
            },
        );
        assert_eq!(err.kind, SessionErrorKind::TransportConnectFailed);
    }
}
