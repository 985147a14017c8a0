#![warn(missing_docs)]

//! microtp-host: the connection group.
//!
//! A [`Host`] owns one datagram transport and every [`TransportSocket`]
//! speaking through it, along with the resources they share: a single
//! [`PacketPool`] for payload storage and a [`BandwidthManager`] with one
//! global channel plus one channel per peer. Everything runs on the thread
//! that calls [`Host::tick`]; events flow out through a crossbeam channel.
//!
//! [`TransportSocket`]: microtp_socket::TransportSocket
//! [`PacketPool`]: microtp_core::packet_pool::PacketPool
//! [`BandwidthManager`]: microtp_protocol::bandwidth::BandwidthManager

/// User-facing host events.
pub mod event_types;
/// Time source abstraction.
pub mod time;
/// UDP transport implementation.
pub mod udp;

mod host;

pub use event_types::HostEvent;
pub use host::Host;
pub use time::{Clock, Interval, SystemClock};
pub use udp::UdpDatagram;
