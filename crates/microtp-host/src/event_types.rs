//! Events the host pushes to the application.

use std::net::SocketAddr;

use microtp_socket::CloseReason;

/// Events that can occur and are pushed through the event receiver.
#[derive(Debug, PartialEq, Eq)]
pub enum HostEvent {
    /// A connection finished its handshake, whichever side initiated.
    Connected(SocketAddr),
    /// An in-order payload arrived from a peer.
    Data(SocketAddr, Vec<u8>),
    /// A connection reached its end; the reason says how.
    Closed(SocketAddr, CloseReason),
}
