#![warn(missing_docs)]

//! Microtp: a small public API facade for the workspace.
//!
//! This crate provides a clean, stable surface that re-exports the most
//! commonly used types to build reliable transport over UDP:
//!
//! - Host and events (`Host`, `HostEvent`, `UdpDatagram`)
//! - Socket state and statistics (`SocketState`, `CloseReason`, ...)
//! - Core configuration (`Config`)
//!
//! Example
//! ```ignore
//! use microtp::{Config, Host, HostEvent, UdpDatagram};
//!
//! let config = Config::default();
//! let mut server = Host::new(UdpDatagram::bind("127.0.0.1:0", &config).unwrap(), config.clone());
//! let server_addr = server.local_addr().unwrap();
//!
//! let mut client = Host::new(UdpDatagram::bind("127.0.0.1:0", &config).unwrap(), config);
//! client.connect(server_addr).unwrap();
//!
//! loop {
//!     client.poll();
//!     server.poll();
//!     if let Some(HostEvent::Connected(addr)) = client.recv() {
//!         client.send(addr, b"hello").unwrap();
//!         break;
//!     }
//! }
//! ```

// Core configuration and errors
pub use microtp_core::{
    config::Config,
    error::{ErrorKind, Result},
    transport::Datagram,
};
// Host: manages multiple sockets and events over one transport
pub use microtp_host::{Clock, Host, HostEvent, SystemClock, UdpDatagram};
// Protocol: congestion policy hook
pub use microtp_protocol::congestion::{CongestionController, WindowCongestion};
// Socket: per-connection state and statistics
pub use microtp_socket::{CloseReason, SocketState, SocketStatistics, TransportSocket};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        CloseReason, Config, Datagram, ErrorKind, Host, HostEvent, SocketState, UdpDatagram,
    };
}
