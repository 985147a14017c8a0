#![warn(missing_docs)]

//! microtp-socket: the transport socket state machine.
//!
//! A [`TransportSocket`] turns an unreliable, unordered datagram substrate
//! into an ordered byte stream: it fragments application writes into
//! sequenced segments, tracks them in a send window until acknowledged,
//! reassembles out-of-order arrivals in a receive window, and retransmits
//! on timeout. Allocation comes from the shared packet pool and send
//! permission from the shared bandwidth manager, both owned by the host.

/// Socket lifecycle states and close reasons.
pub mod state;
/// Per-socket traffic statistics.
pub mod statistics;

mod socket;

pub use socket::TransportSocket;
pub use state::{CloseReason, SocketState};
pub use statistics::SocketStatistics;
