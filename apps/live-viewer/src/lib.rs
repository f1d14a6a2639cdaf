pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod viewer;

pub use config::{ConfigError, ViewerConfig};
pub use error::{PlaybackBlocked, SessionError, SessionErrorKind};
pub use session::{
    ConnectionState, MediaStreamHandle, NegotiationOptions, SessionNegotiator, SessionSnapshot,
};
pub use viewer::{MediaSink, ViewerSurface, ViewerView};
