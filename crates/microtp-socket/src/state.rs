/// Socket connection state machine.
///
/// Tracks the lifecycle of a connection from initial contact through
/// active data transfer to shutdown. A RESET forces `Closed` from any
/// state; every other transition moves forward through the handshake and
/// FIN exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    /// Socket created, no packets exchanged yet.
    #[default]
    Idle,

    /// Initiator: sent SYN, waiting for the acknowledging STATE.
    SynSent,

    /// Responder: received SYN, sent STATE, waiting for confirmation.
    SynReceived,

    /// Handshake complete; data flows in both directions.
    Connected,

    /// We sent FIN; draining acknowledgments for in-flight data.
    FinSent,

    /// Peer sent FIN and its stream is fully delivered; we may still send.
    FinReceived,

    /// Connection finished or aborted; buffers have been discarded.
    Closed,
}

impl SocketState {
    /// Returns true once the handshake has completed.
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            SocketState::Connected | SocketState::FinSent | SocketState::FinReceived
        )
    }

    /// Returns true while the handshake is still in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(self, SocketState::SynSent | SocketState::SynReceived)
    }

    /// Returns true if application data may still be written.
    pub fn can_send(&self) -> bool {
        matches!(self, SocketState::Connected | SocketState::FinReceived)
    }

    /// Returns true once the socket is fully shut down.
    pub fn is_closed(&self) -> bool {
        matches!(self, SocketState::Closed)
    }
}

/// Why a socket reached [`SocketState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Both FINs exchanged and acknowledged, or a local close on an idle
    /// socket.
    Graceful,
    /// The peer sent RESET.
    PeerReset,
    /// No packet was heard from the peer within the idle timeout.
    Timeout,
    /// The peer violated the protocol (e.g. DATA after its FIN).
    ProtocolError,
}
