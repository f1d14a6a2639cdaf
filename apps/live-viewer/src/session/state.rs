use std::fmt;

/// Phase of one viewer session. The negotiator holds the only copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    CapabilitiesLoaded,
    TransportReady,
    AwaitingProducer,
    Consuming,
    Error,
    Closed,
}

impl ConnectionState {
    /// `Error` and `Closed` are left only through a reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Closed)
    }

    /// Declared edges of the handshake. Resetting to `Disconnected` is always
    /// allowed; it starts a new session rather than continuing this one.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (from, Error) => !from.is_terminal(),
            (Disconnected, Connecting)
            | (Connecting, CapabilitiesLoaded)
            | (CapabilitiesLoaded, TransportReady)
            | (TransportReady, AwaitingProducer)
            | (TransportReady, Consuming)
            | (AwaitingProducer, Consuming)
            | (Consuming, Closed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::CapabilitiesLoaded => "capabilities-loaded",
            ConnectionState::TransportReady => "transport-ready",
            ConnectionState::AwaitingProducer => "awaiting-producer",
            ConnectionState::Consuming => "consuming",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn handshake_edges() {
        let path = [
            Disconnected,
            Connecting,
            CapabilitiesLoaded,
            TransportReady,
            AwaitingProducer,
            Consuming,
            Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(TransportReady.can_transition_to(Consuming));
        assert!(!Connecting.can_transition_to(Consuming));
        assert!(!AwaitingProducer.can_transition_to(TransportReady));
        assert!(!Consuming.can_transition_to(AwaitingProducer));
    }

    #[test]
    fn terminal_states_only_reset() {
        for terminal in [Error, Closed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Error));
            assert!(!terminal.can_transition_to(Connecting));
            assert!(terminal.can_transition_to(Disconnected));
        }
        assert!(!Closed.can_transition_to(Closed));
        assert!(Disconnected.can_transition_to(Error));
        assert!(Consuming.can_transition_to(Error));
    }
}
