//! UDP-backed datagram transport.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
};

use microtp_core::{config::Config, error::Result, transport::Datagram};
use socket2::Socket as Socket2;

/// Applies socket options from configuration to a UdpSocket.
fn apply_socket_options(socket: &UdpSocket, config: &Config) -> io::Result<()> {
    let socket2 = Socket2::from(socket.try_clone()?);

    if let Some(size) = config.socket_recv_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket2.set_send_buffer_size(size)?;
    }
    if let Some(ttl) = config.socket_ttl {
        socket.set_ttl(ttl)?;
    }

    Ok(())
}

/// A non-blocking UDP socket implementing [`Datagram`].
#[derive(Debug)]
pub struct UdpDatagram {
    socket: UdpSocket,
}

impl UdpDatagram {
    /// Binds a non-blocking UDP socket with options from the configuration.
    pub fn bind<A: ToSocketAddrs>(addresses: A, config: &Config) -> Result<Self> {
        let socket = UdpSocket::bind(addresses)?;
        apply_socket_options(&socket, config)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// Binds to any available port on localhost.
    pub fn bind_any(config: &Config) -> Result<Self> {
        Self::bind("127.0.0.1:0", config)
    }
}

impl Datagram for UdpDatagram {
    fn send(&mut self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, addr)
    }

    fn receive<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<(&'a [u8], SocketAddr)> {
        self.socket
            .recv_from(buffer)
            .map(move |(length, address)| (&buffer[..length], address))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
