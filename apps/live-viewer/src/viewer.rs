//! Rendering-side glue: turns session snapshots into what a viewer shows and
//! drives the playback element.

use std::future::Future;

use uuid::Uuid;

use crate::error::{PlaybackBlocked, SessionError};
use crate::session::{ConnectionState, MediaStreamHandle, SessionNegotiator, SessionSnapshot};

/// Whatever actually plays the stream (a video element, a decoder, a log).
pub trait MediaSink {
    /// `None` detaches the current stream.
    fn attach(&mut self, stream: Option<&MediaStreamHandle>);

    /// May be refused by an autoplay policy.
    fn play(&mut self) -> Result<(), PlaybackBlocked>;

    fn set_muted(&mut self, muted: bool);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerView {
    pub state: ConnectionState,
    pub status: String,
    /// Playback was refused; a manual "Play" control must be offered.
    pub play_prompt: bool,
    pub can_reconnect: bool,
    pub muted: bool,
    pub stream: Option<Uuid>,
}

pub fn status_text(state: ConnectionState, error: Option<&SessionError>) -> String {
    match state {
        ConnectionState::Disconnected => "Disconnected".into(),
        ConnectionState::Connecting => "Connecting…".into(),
        ConnectionState::CapabilitiesLoaded => "Preparing media…".into(),
        ConnectionState::TransportReady => "Looking for the broadcaster…".into(),
        ConnectionState::AwaitingProducer => "Waiting for the broadcaster…".into(),
        ConnectionState::Consuming => "Live".into(),
        ConnectionState::Closed => "Stream ended".into(),
        ConnectionState::Error => match error {
            Some(error) => error.to_string(),
            None => "Something went wrong".into(),
        },
    }
}

pub struct ViewerSurface<S> {
    negotiator: SessionNegotiator,
    sink: S,
    attached: Option<Uuid>,
    muted: Option<bool>,
    view: ViewerView,
}

impl<S: MediaSink> ViewerSurface<S> {
    pub fn new(negotiator: SessionNegotiator, sink: S) -> Self {
        Self {
            negotiator,
            sink,
            attached: None,
            muted: None,
            view: ViewerView::default(),
        }
    }

    pub fn view(&self) -> &ViewerView {
        &self.view
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn negotiator(&self) -> &SessionNegotiator {
        &self.negotiator
    }

    pub fn render(&mut self, snapshot: &SessionSnapshot) -> &ViewerView {
        let current = snapshot.stream.as_ref().map(|stream| stream.id);
        if current != self.attached {
            self.sink.attach(snapshot.stream.as_ref());
            self.attached = current;
            self.view.play_prompt = false;
            if current.is_some() {
                self.start_playback();
            }
        }
        if self.muted != Some(snapshot.muted) {
            self.sink.set_muted(snapshot.muted);
            self.muted = Some(snapshot.muted);
        }

        self.view.state = snapshot.state;
        self.view.status = status_text(snapshot.state, snapshot.error.as_ref());
        self.view.can_reconnect = snapshot.state.is_terminal();
        self.view.muted = snapshot.muted;
        self.view.stream = current;
        &self.view
    }

    /// The manual "Play" control.
    pub fn play(&mut self) -> Result<(), PlaybackBlocked> {
        if self.attached.is_none() {
            return Ok(());
        }
        let result = self.sink.play();
        self.view.play_prompt = result.is_err();
        result
    }

    pub async fn reconnect(&self) -> u64 {
        self.negotiator.reconnect().await
    }

    pub fn set_muted(&self, muted: bool) {
        self.negotiator.mute(muted);
    }

    pub fn toggle_mute(&self) {
        self.negotiator.mute(!self.negotiator.snapshot().muted);
    }

    /// Renders every snapshot until `shutdown` resolves or the negotiator is
    /// gone. `on_view` sees each rendered view.
    pub async fn run<F>(&mut self, shutdown: F, mut on_view: impl FnMut(&ViewerView))
    where
        F: Future<Output = ()>,
    {
        let mut snapshots = self.negotiator.subscribe();
        tokio::pin!(shutdown);
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            on_view(self.render(&snapshot));
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = &mut shutdown => return,
            }
        }
    }

    fn start_playback(&mut self) {
        if let Err(blocked) = self.sink.play() {
            tracing::info!(target: "viewer", reason = %blocked.reason, "autoplay refused, waiting for manual play");
            self.view.play_prompt = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionErrorKind;
    use crate::media::{LoopbackEngine, MediaTrack};
    use crate::protocol::MediaKind;
    use crate::session::NegotiationOptions;
    use crate::signaling::{SignalingClient, SignalingConfig};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingSink {
        attached: Vec<Option<Uuid>>,
        plays: usize,
        block: bool,
        muted: Option<bool>,
    }

    impl MediaSink for RecordingSink {
        fn attach(&mut self, stream: Option<&MediaStreamHandle>) {
            self.attached.push(stream.map(|stream| stream.id));
        }

        fn play(&mut self) -> Result<(), PlaybackBlocked> {
            self.plays += 1;
            if self.block {
                Err(PlaybackBlocked::new("user gesture required"))
            } else {
                Ok(())
            }
        }

        fn set_muted(&mut self, muted: bool) {
            self.muted = Some(muted);
        }
    }

    fn surface(sink: RecordingSink) -> ViewerSurface<RecordingSink> {
        let url = url::Url::parse("ws://127.0.0.1:9/signaling").expect("url");
        let negotiator = SessionNegotiator::new(
            Arc::new(SignalingClient::new(SignalingConfig::new(url))),
            Arc::new(LoopbackEngine::new()),
            NegotiationOptions::default(),
        );
        ViewerSurface::new(negotiator, sink)
    }

    fn consuming() -> SessionSnapshot {
        SessionSnapshot {
            generation: 1,
            state: ConnectionState::Consuming,
            stream: Some(MediaStreamHandle {
                id: Uuid::new_v4(),
                track: MediaTrack {
                    id: "track".into(),
                    kind: MediaKind::Video,
                },
                producer_id: "p9".into(),
                consumer_id: "c1".into(),
            }),
            error: None,
            muted: false,
        }
    }

    #[test]
    fn blocked_autoplay_offers_manual_play() {
        let mut surface = surface(RecordingSink {
            block: true,
            ..RecordingSink::default()
        });
        let snapshot = consuming();
        let view = surface.render(&snapshot).clone();
        assert!(view.play_prompt);
        assert_eq!(view.state, ConnectionState::Consuming);
        assert_eq!(view.status, "Live");

        surface.sink.block = false;
        surface.play().expect("manual play");
        assert!(!surface.view().play_prompt);
        assert_eq!(surface.sink().plays, 2);

        // Same stream again: no re-attach, no extra play.
        surface.render(&snapshot);
        assert_eq!(surface.sink().attached.len(), 1);
        assert_eq!(surface.sink().plays, 2);
    }

    #[test]
    fn terminal_states_detach_and_offer_reconnect() {
        let mut surface = surface(RecordingSink::default());
        surface.render(&consuming());
        let failed = SessionSnapshot {
            generation: 1,
            state: ConnectionState::Error,
            stream: None,
            error: Some(SessionError::new(
                SessionErrorKind::ConsumerResumeFailed,
                "consumer not found",
            )),
            muted: true,
        };
        let view = surface.render(&failed).clone();
        assert!(view.can_reconnect);
        assert!(view.stream.is_none());
        assert_eq!(view.status, "consumer resume failed: consumer not found");
        assert_eq!(surface.sink().attached.last(), Some(&None));
        assert_eq!(surface.sink().muted, Some(true));
    }

    #[test]
    fn status_text_covers_waiting_and_ended() {
        assert_eq!(
            status_text(ConnectionState::AwaitingProducer, None),
            "Waiting for the broadcaster…"
        );
        assert_eq!(status_text(ConnectionState::Closed, None), "Stream ended");
        assert_eq!(
            status_text(ConnectionState::Error, None),
            "Something went wrong"
        );
    }
}
