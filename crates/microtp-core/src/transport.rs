//! Datagram transport abstraction for pluggable I/O.

use std::{io::Result, net::SocketAddr};

/// Low-level datagram socket abstraction.
///
/// This trait allows various transports (UDP, an in-memory pair for tests,
/// a conditioner that drops or reorders packets) to be plugged into the
/// connection group without coupling to a concrete implementation. The
/// transport is expected to be non-blocking: `receive` returns
/// `WouldBlock` when no datagram is pending.
pub trait Datagram {
    /// Sends a single datagram to the given address.
    fn send(&mut self, addr: &SocketAddr, payload: &[u8]) -> Result<usize>;

    /// Receives a single datagram, returning the filled slice and sender.
    fn receive<'a>(&mut self, buffer: &'a mut [u8]) -> Result<(&'a [u8], SocketAddr)>;

    /// Returns the local address this transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}
