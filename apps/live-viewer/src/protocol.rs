//! Signaling wire frames and the descriptors exchanged during negotiation.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DescriptorError;

pub mod request {
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "get-router-rtp-capabilities";
    pub const CREATE_CONSUMER_TRANSPORT: &str = "create-consumer-transport";
    pub const CONNECT_CONSUMER_TRANSPORT: &str = "connect-consumer-transport";
    pub const GET_PRODUCERS: &str = "get-producers";
    pub const CONSUME: &str = "consume";
    pub const CONSUMER_RESUME: &str = "consumer-resume";
}

pub mod event {
    pub const PRODUCER_READY: &str = "producer-ready";
    pub const PRODUCER_CLOSED: &str = "producer-closed";
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const CONNECT_ERROR: &str = "connect_error";
}

/// Frames the viewer sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Request {
        id: u64,
        name: String,
        #[serde(default)]
        data: Value,
    },
}

/// Frames the signaling peer sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        id: u64,
        #[serde(default)]
        data: Value,
    },
    Event {
        name: String,
        #[serde(default)]
        data: Value,
    },
}

/// Message carried by the `error` field of a reply, if any.
pub fn rejection(data: &Value) -> Option<String> {
    match data.get("error")? {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

pub type ProducerId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    #[default]
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        })
    }
}

fn decode<T: DeserializeOwned>(descriptor: &'static str, value: Value) -> Result<T, DescriptorError> {
    serde_json::from_value(value).map_err(|err| DescriptorError::Malformed {
        descriptor,
        reason: err.to_string(),
    })
}

fn require<T>(
    descriptor: &'static str,
    field: &'static str,
    value: Option<T>,
) -> Result<T, DescriptorError> {
    value.ok_or(DescriptorError::MissingField { descriptor, field })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

/// Codecs and header extensions the SFU router supports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilities {
    pub codecs: Vec<Value>,
    pub header_extensions: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRouterCapabilities {
    codecs: Option<Vec<Value>>,
    #[serde(default)]
    header_extensions: Vec<Value>,
}

impl RouterCapabilities {
    const NAME: &'static str = "router capabilities";

    pub fn from_value(value: Value) -> Result<Self, DescriptorError> {
        let raw: RawRouterCapabilities = decode(Self::NAME, value)?;
        let codecs = require(Self::NAME, "codecs", raw.codecs)?;
        if codecs.is_empty() {
            return Err(DescriptorError::Malformed {
                descriptor: Self::NAME,
                reason: "codec list is empty".into(),
            });
        }
        Ok(Self {
            codecs,
            header_extensions: raw.header_extensions,
        })
    }

    pub fn mime_types(&self) -> Vec<String> {
        self.codecs
            .iter()
            .filter_map(|codec| codec.get("mimeType").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

/// Receive transport parameters issued by the signaling peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: String,
    pub ice_parameters: Option<Value>,
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: Value,
    pub sctp_parameters: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransportDescriptor {
    id: Option<String>,
    ice_parameters: Option<Value>,
    #[serde(default)]
    ice_candidates: Vec<Value>,
    dtls_parameters: Option<Value>,
    sctp_parameters: Option<Value>,
}

impl TransportDescriptor {
    const NAME: &'static str = "transport descriptor";

    pub fn from_value(value: Value) -> Result<Self, DescriptorError> {
        let raw: RawTransportDescriptor = decode(Self::NAME, value)?;
        Ok(Self {
            id: require(Self::NAME, "id", non_empty(raw.id))?,
            ice_parameters: raw.ice_parameters,
            ice_candidates: raw.ice_candidates,
            dtls_parameters: require(Self::NAME, "dtlsParameters", raw.dtls_parameters)?,
            sctp_parameters: raw.sctp_parameters,
        })
    }
}

/// Server-side consumer created for one producer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: String,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConsumerDescriptor {
    id: Option<String>,
    producer_id: Option<String>,
    #[serde(default)]
    kind: MediaKind,
    rtp_parameters: Option<Value>,
}

impl ConsumerDescriptor {
    const NAME: &'static str = "consumer descriptor";

    pub fn from_value(value: Value) -> Result<Self, DescriptorError> {
        let raw: RawConsumerDescriptor = decode(Self::NAME, value)?;
        Ok(Self {
            id: require(Self::NAME, "id", non_empty(raw.id))?,
            producer_id: require(Self::NAME, "producerId", non_empty(raw.producer_id))?,
            kind: raw.kind,
            rtp_parameters: require(Self::NAME, "rtpParameters", raw.rtp_parameters)?,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProducerEntry {
    Id(String),
    Described {
        #[serde(rename = "producerId", alias = "id")]
        producer_id: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProducerList {
    Bare(Vec<ProducerEntry>),
    Wrapped { producers: Vec<ProducerEntry> },
}

/// Active producer ids in the order the peer listed them.
pub fn parse_producer_list(value: Value) -> Result<Vec<ProducerId>, DescriptorError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let entries = match decode::<ProducerList>("producer list", value)? {
        ProducerList::Bare(entries) => entries,
        ProducerList::Wrapped { producers } => producers,
    };
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            ProducerEntry::Id(id) => id,
            ProducerEntry::Described { producer_id } => producer_id,
        })
        .filter(|id| !id.trim().is_empty())
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerEvent {
    pub producer_id: ProducerId,
}

impl ProducerEvent {
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest<'a> {
    pub dtls_parameters: &'a Value,
    pub transport_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest<'a> {
    pub transport_id: &'a str,
    pub producer_id: &'a str,
    pub rtp_capabilities: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest<'a> {
    pub consumer_id: &'a str,
}
