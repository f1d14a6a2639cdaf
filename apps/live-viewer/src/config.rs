use std::env;
use std::time::Duration;

use url::Url;

use crate::session::NegotiationOptions;
use crate::signaling::SignalingConfig;

pub const ENV_SIGNALING_URL: &str = "LIVE_VIEWER_SIGNALING_URL";
pub const ENV_SIGNALING_PATH: &str = "LIVE_VIEWER_SIGNALING_PATH";
pub const ENV_STREAM: &str = "LIVE_VIEWER_STREAM";
pub const ENV_TRANSPORTS: &str = "LIVE_VIEWER_TRANSPORTS";
pub const ENV_RECONNECT_ATTEMPTS: &str = "LIVE_VIEWER_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_DELAY_MS: &str = "LIVE_VIEWER_RECONNECT_DELAY_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "LIVE_VIEWER_REQUEST_TIMEOUT_MS";
pub const ENV_PRODUCER_WAIT_MS: &str = "LIVE_VIEWER_PRODUCER_WAIT_MS";

const DEFAULT_URL: &str = "localhost:3000";
const SUPPORTED_TRANSPORT: &str = "websocket";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid signaling url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no supported transport in {0:?} (only websocket is available)")]
    NoSupportedTransport(Vec<String>),
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Where the signaling peer lives and how patiently to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerConfig {
    /// Host, `host:port` or full URL of the signaling server.
    pub url: String,
    pub path: String,
    /// Stream/session id passed to the server as a query parameter.
    pub stream: Option<String>,
    /// Transport preference list, first supported entry wins.
    pub transports: Vec<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    /// `None` disables the per-request deadline.
    pub request_timeout: Option<Duration>,
    pub producer_wait_timeout: Option<Duration>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            path: "/signaling".to_string(),
            stream: None,
            transports: vec![SUPPORTED_TRANSPORT.to_string()],
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(25),
            request_timeout: Some(Duration::from_secs(10)),
            producer_wait_timeout: None,
        }
    }
}

impl ViewerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());

        if let Some(url) = get(ENV_SIGNALING_URL) {
            config.url = url.trim().to_string();
        }
        if let Some(path) = get(ENV_SIGNALING_PATH) {
            config.path = path.trim().to_string();
        }
        config.stream = get(ENV_STREAM).map(|stream| stream.trim().to_string());
        if let Some(list) = get(ENV_TRANSPORTS) {
            config.transports = list
                .split(',')
                .map(|entry| entry.trim().to_ascii_lowercase())
                .filter(|entry| !entry.is_empty())
                .collect();
        }
        if let Some(value) = get(ENV_RECONNECT_ATTEMPTS) {
            config.reconnect_attempts = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: ENV_RECONNECT_ATTEMPTS,
                    value,
                })?;
        }
        if let Some(value) = get(ENV_RECONNECT_DELAY_MS) {
            config.reconnect_delay = Duration::from_millis(parse_millis(ENV_RECONNECT_DELAY_MS, value)?);
        }
        if let Some(value) = get(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout = optional_millis(parse_millis(ENV_REQUEST_TIMEOUT_MS, value)?);
        }
        if let Some(value) = get(ENV_PRODUCER_WAIT_MS) {
            config.producer_wait_timeout = optional_millis(parse_millis(ENV_PRODUCER_WAIT_MS, value)?);
        }
        Ok(config)
    }

    /// WebSocket URL of the signaling endpoint, scheme and query included.
    pub fn signaling_url(&self) -> Result<Url, ConfigError> {
        if !self
            .transports
            .iter()
            .any(|transport| transport == SUPPORTED_TRANSPORT)
        {
            return Err(ConfigError::NoSupportedTransport(self.transports.clone()));
        }
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason,
        };

        let raw = self.url.trim();
        let with_scheme = match raw.split_once("://") {
            Some(("http", rest)) => format!("ws://{rest}"),
            Some(("https", rest)) => format!("wss://{rest}"),
            Some(("ws" | "wss", _)) => raw.to_string(),
            Some((scheme, _)) => return Err(invalid(format!("unsupported scheme {scheme}"))),
            None => {
                let host = raw.split([':', '/']).next().unwrap_or_default();
                let scheme = if is_local(host) { "ws" } else { "wss" };
                format!("{scheme}://{raw}")
            }
        };

        let mut url = Url::parse(&with_scheme).map_err(|err| invalid(err.to_string()))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host".into()));
        }
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        url.set_path(&path);
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.append_pair("transport", SUPPORTED_TRANSPORT);
            if let Some(stream) = &self.stream {
                query.append_pair("stream", stream);
            }
        }
        Ok(url)
    }

    pub fn signaling_config(&self) -> Result<SignalingConfig, ConfigError> {
        let mut config = SignalingConfig::new(self.signaling_url()?);
        config.reconnect_attempts = self.reconnect_attempts;
        config.reconnect_delay = self.reconnect_delay;
        config.heartbeat_interval = self.heartbeat_interval;
        Ok(config)
    }

    pub fn negotiation_options(&self) -> NegotiationOptions {
        NegotiationOptions {
            request_timeout: self.request_timeout,
            producer_wait: self.producer_wait_timeout,
        }
    }
}

fn parse_millis(var: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { var, value })
}

/// `0` means no deadline.
pub fn optional_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "0.0.0.0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ViewerConfig::from_lookup(|_| None).expect("config");
        assert_eq!(config, ViewerConfig::default());
        assert_eq!(
            config.signaling_url().expect("url").as_str(),
            "ws://localhost:3000/signaling?transport=websocket"
        );
        assert_eq!(
            config.negotiation_options(),
            NegotiationOptions::default()
        );
    }

    #[test]
    fn environment_overrides() {
        let config = ViewerConfig::from_lookup(lookup(&[
            (ENV_SIGNALING_URL, "https://live.example.com"),
            (ENV_SIGNALING_PATH, "rtc"),
            (ENV_STREAM, "lecture-42"),
            (ENV_TRANSPORTS, "polling, WebSocket"),
            (ENV_RECONNECT_ATTEMPTS, "3"),
            (ENV_RECONNECT_DELAY_MS, "500"),
            (ENV_REQUEST_TIMEOUT_MS, "0"),
            (ENV_PRODUCER_WAIT_MS, "30000"),
        ]))
        .expect("config");
        assert_eq!(config.transports, vec!["polling", "websocket"]);
        assert_eq!(config.reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay, Duration::from_millis(500));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.producer_wait_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.signaling_url().expect("url").as_str(),
            "wss://live.example.com/rtc?transport=websocket&stream=lecture-42"
        );
    }

    #[test]
    fn bare_remote_host_uses_tls() {
        let config = ViewerConfig {
            url: "media.example.com:4443".into(),
            ..ViewerConfig::default()
        };
        assert_eq!(
            config.signaling_url().expect("url").as_str(),
            "wss://media.example.com:4443/signaling?transport=websocket"
        );
    }

    #[test]
    fn rejects_unusable_settings() {
        let err = ViewerConfig::from_lookup(lookup(&[(ENV_RECONNECT_ATTEMPTS, "many")]))
            .expect_err("not a number");
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));

        let config = ViewerConfig {
            transports: vec!["polling".into()],
            ..ViewerConfig::default()
        };
        assert!(matches!(
            config.signaling_url(),
            Err(ConfigError::NoSupportedTransport(_))
        ));

        let config = ViewerConfig {
            url: "ftp://example.com".into(),
            ..ViewerConfig::default()
        };
        assert!(matches!(
            config.signaling_url(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }
}
