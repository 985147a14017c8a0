//! The connection group: one transport, many sockets, shared resources.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use microtp_core::{
    config::Config,
    error::{ErrorKind, Result},
    packet_pool::PacketPool,
    transport::Datagram,
};
use microtp_protocol::{
    bandwidth::{BandwidthManager, ChannelId},
    packet::{PacketHeader, PacketKind},
};
use microtp_socket::{CloseReason, TransportSocket};

use crate::{
    event_types::HostEvent,
    time::{Clock, Interval, SystemClock},
};

/// How often bandwidth quotas refill and the pool sheds idle buffers.
const REFILL_INTERVAL: Duration = Duration::from_secs(1);

/// Queues an event for the application.
///
/// The event buffer holds at most `Config::event_buffer_size` undrained
/// events; once full, new events are dropped rather than growing the queue
/// behind an application that has stopped reading.
fn emit(sender: &Sender<HostEvent>, event: HostEvent) {
    if let Err(TrySendError::Full(event)) = sender.try_send(event) {
        tracing::warn!("Event buffer full, dropping {:?}", event);
    }
}

/// A group of connections multiplexed over one datagram transport.
///
/// The host owns the shared packet pool and the bandwidth manager; sockets
/// borrow both through it. Each [`tick`](Self::tick) drains inbound
/// datagrams into the sockets, runs their timers, pumps admitted outbound
/// frames, and reaps closed connections. Nothing here spawns threads: the
/// caller decides the polling cadence.
pub struct Host<T: Datagram> {
    transport: T,
    config: Config,
    pool: PacketPool,
    sockets: HashMap<SocketAddr, TransportSocket>,

    bandwidth: BandwidthManager<SocketAddr>,
    global_channel: ChannelId,
    peer_channels: HashMap<SocketAddr, ChannelId>,
    /// Channel ids whose peers have gone, kept for reuse.
    free_channels: Vec<ChannelId>,
    refill: Interval,

    receive_buffer: Vec<u8>,
    event_sender: Sender<HostEvent>,
    event_receiver: Receiver<HostEvent>,
    clock: Arc<dyn Clock>,
}

impl<T: Datagram> Host<T> {
    /// Creates a host over the given transport with the system clock.
    pub fn new(transport: T, config: Config) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    /// Creates a host with a caller-supplied clock for testing.
    pub fn with_clock(transport: T, config: Config, clock: Arc<dyn Clock>) -> Self {
        let (event_sender, event_receiver) = bounded(config.event_buffer_size);
        let mut bandwidth = BandwidthManager::new();
        let global_channel = bandwidth.add_channel(config.global_rate_limit);
        let pool = PacketPool::new(&config);
        let receive_buffer = vec![0; config.mtu_ceiling as usize];
        let now = clock.now();
        Self {
            transport,
            pool,
            sockets: HashMap::new(),
            bandwidth,
            global_channel,
            peer_channels: HashMap::new(),
            free_channels: Vec::new(),
            refill: Interval::new(REFILL_INTERVAL, now),
            receive_buffer,
            event_sender,
            event_receiver,
            clock,
            config,
        }
    }

    /// Returns the local address of the underlying transport.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Returns a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns a mutable reference to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Returns the event receiver; clone it to consume events elsewhere.
    pub fn event_receiver(&self) -> &Receiver<HostEvent> {
        &self.event_receiver
    }

    /// Receives the next pending event, if any.
    pub fn recv(&mut self) -> Option<HostEvent> {
        match self.event_receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => unreachable!("host holds the sender"),
        }
    }

    /// Returns the number of sockets, in any state.
    pub fn connection_count(&self) -> usize {
        self.sockets.len()
    }

    /// Returns a reference to the socket for `address`, if one exists.
    pub fn socket(&self, address: &SocketAddr) -> Option<&TransportSocket> {
        self.sockets.get(address)
    }

    /// Initiates a connection to a peer.
    pub fn connect(&mut self, address: SocketAddr) -> Result<()> {
        if self.sockets.contains_key(&address) {
            return Err(ErrorKind::ProtocolViolation("already connected to this peer"));
        }
        let now = self.clock.now();
        let mut socket = TransportSocket::new(address, &self.config, now);
        socket.connect(&mut self.pool)?;
        self.register_peer_channel(address);
        self.sockets.insert(address, socket);
        Ok(())
    }

    /// Queues data for a connected peer, returning the bytes accepted.
    pub fn send(&mut self, address: SocketAddr, data: &[u8]) -> Result<usize> {
        let socket = self
            .sockets
            .get_mut(&address)
            .ok_or(ErrorKind::ProtocolViolation("send to an unknown peer"))?;
        socket.write(data, &mut self.pool)
    }

    /// Begins a graceful shutdown of the connection to `address`.
    pub fn close(&mut self, address: SocketAddr) -> Result<()> {
        let socket = self
            .sockets
            .get_mut(&address)
            .ok_or(ErrorKind::ProtocolViolation("close of an unknown peer"))?;
        socket.close(&mut self.pool)
    }

    /// Abortively closes the connection to `address` with a RESET.
    pub fn abort(&mut self, address: SocketAddr) {
        if let Some(socket) = self.sockets.get_mut(&address) {
            socket.abort(&mut self.pool);
        }
    }

    /// Runs one scheduler pass using the host's clock.
    pub fn poll(&mut self) {
        self.tick(self.clock.now());
    }

    /// Runs one scheduler pass at the given time.
    pub fn tick(&mut self, now: Instant) {
        self.drain_transport(now);

        if self.refill.poll(now) {
            for (address, amount) in self.bandwidth.tick() {
                match self.sockets.get_mut(&address) {
                    Some(socket) => socket.grant_credit(amount),
                    // Closed sockets cancel their parked requests, so a
                    // grant without a socket should not happen.
                    None => tracing::debug!("Discarding grant for departed peer {}", address),
                }
            }
            self.pool.decay();
        }

        for socket in self.sockets.values_mut() {
            socket.tick(now, &mut self.pool);
        }

        let addresses: Vec<SocketAddr> = self.sockets.keys().copied().collect();
        for address in addresses {
            self.pump_socket(address, now);
        }

        self.reap_closed();
    }

    /// Reads every pending datagram from the transport into its socket.
    fn drain_transport(&mut self, now: Instant) {
        loop {
            let frame = match self.transport.receive(&mut self.receive_buffer) {
                Ok((payload, address)) => (address, payload.to_vec()),
                Err(err) => {
                    if err.kind() != std::io::ErrorKind::WouldBlock {
                        tracing::error!("Encountered an error receiving data: {:?}", err);
                    }
                    break;
                }
            };
            let (address, bytes) = frame;
            self.handle_inbound(address, &bytes, now);
        }
    }

    fn handle_inbound(&mut self, address: SocketAddr, bytes: &[u8], now: Instant) {
        if let Some(socket) = self.sockets.get_mut(&address) {
            let was_established = socket.state().is_established();
            if let Err(err) = socket.handle_datagram(bytes, &mut self.pool, now) {
                tracing::warn!("Error processing datagram from {}: {}", address, err);
            }
            if !was_established && socket.state().is_established() {
                emit(&self.event_sender, HostEvent::Connected(address));
            }
            while let Some(payload) = socket.take_delivered() {
                emit(&self.event_sender, HostEvent::Data(address, payload));
            }
            return;
        }

        // Unknown peer: accept a SYN, answer anything else sequenced with a
        // RESET so half-open remotes give up.
        match PacketHeader::decode(bytes) {
            Ok((header, _)) if header.kind == PacketKind::Syn => {
                let mut socket = TransportSocket::new(address, &self.config, now);
                if let Err(err) = socket.handle_datagram(bytes, &mut self.pool, now) {
                    tracing::warn!("Error accepting connection from {}: {}", address, err);
                    return;
                }
                self.register_peer_channel(address);
                self.sockets.insert(address, socket);
            }
            Ok((header, _)) if header.kind != PacketKind::Reset => {
                self.send_reset(address, header.connection_id);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("Undecodable datagram from {}: {}", address, err);
            }
        }
    }

    fn send_reset(&mut self, address: SocketAddr, connection_id: u16) {
        let header = PacketHeader {
            kind: PacketKind::Reset,
            connection_id,
            sequence: 0,
            ack_sequence: 0,
            window: 0,
        };
        let mut frame = Vec::new();
        header.encode_into(&mut frame);
        if let Err(err) = self.transport.send(&address, &frame) {
            tracing::error!("Error sending RESET to {}: {}", address, err);
        }
    }

    /// Sends everything a socket has ready: control frames unconditionally,
    /// sequenced frames as bandwidth admission allows.
    fn pump_socket(&mut self, address: SocketAddr, now: Instant) {
        loop {
            let frame = match self.sockets.get_mut(&address) {
                Some(socket) => match socket.take_control_frame() {
                    Some(frame) => frame,
                    None => break,
                },
                None => return,
            };
            if let Err(err) = self.transport.send(&address, &frame) {
                tracing::error!("Error sending control frame to {}: {}", address, err);
            }
        }

        let channels = self.admission_channels(&address);
        loop {
            let socket = match self.sockets.get_mut(&address) {
                Some(socket) => socket,
                None => return,
            };
            let wire_len = match socket.next_transmit_len() {
                Some(length) => length as u32,
                None => break,
            };

            if socket.bandwidth_credit() >= wire_len {
                socket.consume_credit(wire_len);
                if let Some(frame) = socket.transmit_next(now) {
                    if let Err(err) = self.transport.send(&address, &frame) {
                        tracing::error!("Error sending a packet to {}: {}", address, err);
                    }
                }
            } else if socket.admission_pending() {
                // A request is already in line; later frames wait their
                // turn so transmission order is preserved.
                break;
            } else {
                let shortfall = wire_len - socket.bandwidth_credit();
                if self.bandwidth.request(address, shortfall, &channels) {
                    socket.grant_credit(shortfall);
                } else {
                    socket.set_admission_pending();
                    break;
                }
            }
        }
    }

    /// The channels a socket's traffic is subject to: the group-wide
    /// channel plus the socket's own.
    fn admission_channels(&self, address: &SocketAddr) -> Vec<ChannelId> {
        match self.peer_channels.get(address) {
            Some(peer_channel) => vec![self.global_channel, *peer_channel],
            None => vec![self.global_channel],
        }
    }

    fn register_peer_channel(&mut self, address: SocketAddr) -> ChannelId {
        if let Some(id) = self.peer_channels.get(&address) {
            return *id;
        }
        let id = match self.free_channels.pop() {
            Some(id) => {
                let channel = self.bandwidth.channel_mut(id);
                channel.set_limit(self.config.peer_rate_limit);
                channel.refill();
                id
            }
            None => self.bandwidth.add_channel(self.config.peer_rate_limit),
        };
        self.peer_channels.insert(address, id);
        id
    }

    /// Removes closed sockets, releasing their shared resources.
    fn reap_closed(&mut self) {
        let closed: Vec<(SocketAddr, CloseReason)> = self
            .sockets
            .iter()
            .filter(|(_, socket)| socket.state().is_closed())
            .map(|(address, socket)| {
                (*address, socket.close_reason().unwrap_or(CloseReason::Graceful))
            })
            .collect();

        for (address, reason) in closed {
            self.sockets.remove(&address);
            self.bandwidth.cancel(address);
            if let Some(channel) = self.peer_channels.remove(&address) {
                self.free_channels.push(channel);
            }
            emit(&self.event_sender, HostEvent::Closed(address, reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// An in-memory transport: sends land in `outbox`, `receive` pops from
    /// `inbox`.
    struct MemoryTransport {
        address: SocketAddr,
        inbox: VecDeque<(SocketAddr, Vec<u8>)>,
        outbox: VecDeque<(SocketAddr, Vec<u8>)>,
    }

    impl MemoryTransport {
        fn new(address: &str) -> Self {
            Self {
                address: address.parse().unwrap(),
                inbox: VecDeque::new(),
                outbox: VecDeque::new(),
            }
        }
    }

    impl Datagram for MemoryTransport {
        fn send(&mut self, addr: &SocketAddr, payload: &[u8]) -> std::io::Result<usize> {
            self.outbox.push_back((*addr, payload.to_vec()));
            Ok(payload.len())
        }

        fn receive<'a>(
            &mut self,
            buffer: &'a mut [u8],
        ) -> std::io::Result<(&'a [u8], SocketAddr)> {
            match self.inbox.pop_front() {
                Some((from, payload)) => {
                    let length = payload.len().min(buffer.len());
                    buffer[..length].copy_from_slice(&payload[..length]);
                    Ok((&buffer[..length], from))
                }
                None => Err(std::io::ErrorKind::WouldBlock.into()),
            }
        }

        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            Ok(self.address)
        }
    }

    /// Moves every frame each host has sent into the other host's inbox.
    fn exchange(a: &mut Host<MemoryTransport>, b: &mut Host<MemoryTransport>) {
        let a_addr = a.transport().address;
        let b_addr = b.transport().address;
        while let Some((to, frame)) = a.transport_mut().outbox.pop_front() {
            assert_eq!(to, b_addr);
            b.transport_mut().inbox.push_back((a_addr, frame));
        }
        while let Some((to, frame)) = b.transport_mut().outbox.pop_front() {
            assert_eq!(to, a_addr);
            a.transport_mut().inbox.push_back((b_addr, frame));
        }
    }

    fn pair(config: Config) -> (Host<MemoryTransport>, Host<MemoryTransport>) {
        (
            Host::new(MemoryTransport::new("10.1.0.1:9000"), config.clone()),
            Host::new(MemoryTransport::new("10.1.0.2:9000"), config),
        )
    }

    fn settle(a: &mut Host<MemoryTransport>, b: &mut Host<MemoryTransport>, now: Instant) {
        for _ in 0..8 {
            a.tick(now);
            b.tick(now);
            exchange(a, b);
        }
        a.tick(now);
        b.tick(now);
    }

    #[test]
    fn test_connect_emits_connected_on_both_sides() {
        let (mut client, mut server) = pair(Config::default());
        let server_addr = server.local_addr().unwrap();

        client.connect(server_addr).unwrap();
        settle(&mut client, &mut server, Instant::now());

        assert_eq!(client.recv(), Some(HostEvent::Connected(server_addr)));
        let client_addr = client.local_addr().unwrap();
        assert_eq!(server.recv(), Some(HostEvent::Connected(client_addr)));
    }

    #[test]
    fn test_data_flows_between_hosts() {
        let (mut client, mut server) = pair(Config::default());
        let server_addr = server.local_addr().unwrap();
        let client_addr = client.local_addr().unwrap();

        client.connect(server_addr).unwrap();
        let now = Instant::now();
        settle(&mut client, &mut server, now);
        while client.recv().is_some() {}
        while server.recv().is_some() {}

        assert_eq!(client.send(server_addr, b"ping").unwrap(), 4);
        settle(&mut client, &mut server, now);

        assert_eq!(
            server.recv(),
            Some(HostEvent::Data(client_addr, b"ping".to_vec()))
        );

        assert_eq!(server.send(client_addr, b"pong").unwrap(), 4);
        settle(&mut client, &mut server, now);
        assert_eq!(
            client.recv(),
            Some(HostEvent::Data(server_addr, b"pong".to_vec()))
        );
    }

    #[test]
    fn test_close_reaps_socket_and_emits_event() {
        let (mut client, mut server) = pair(Config::default());
        let server_addr = server.local_addr().unwrap();

        client.connect(server_addr).unwrap();
        let now = Instant::now();
        settle(&mut client, &mut server, now);

        client.close(server_addr).unwrap();
        settle(&mut client, &mut server, now);
        let client_addr = client.local_addr().unwrap();
        server.close(client_addr).unwrap();
        settle(&mut client, &mut server, now);

        assert_eq!(client.connection_count(), 0);
        assert_eq!(server.connection_count(), 0);

        let closed = |host: &mut Host<MemoryTransport>| loop {
            match host.recv() {
                Some(HostEvent::Closed(_, reason)) => break reason,
                Some(_) => continue,
                None => panic!("no closed event"),
            }
        };
        assert_eq!(closed(&mut client), CloseReason::Graceful);
        assert_eq!(closed(&mut server), CloseReason::Graceful);
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let (mut client, _server) = pair(Config::default());
        let somewhere = "10.9.9.9:1".parse().unwrap();
        assert!(client.send(somewhere, b"void").is_err());
    }

    #[test]
    fn test_unexpected_data_answered_with_reset() {
        let (mut host, _other) = pair(Config::default());
        let stranger: SocketAddr = "10.2.0.9:4444".parse().unwrap();

        // A data frame from a peer we have no socket for.
        let header = PacketHeader {
            kind: PacketKind::Data,
            connection_id: 77,
            sequence: 5,
            ack_sequence: 0,
            window: 0,
        };
        let mut frame = Vec::new();
        header.encode_into(&mut frame);
        frame.extend_from_slice(b"ghost");
        host.transport_mut().inbox.push_back((stranger, frame));

        host.tick(Instant::now());

        let (to, answer) = host.transport_mut().outbox.pop_front().unwrap();
        assert_eq!(to, stranger);
        let (answer_header, _) = PacketHeader::decode(&answer).unwrap();
        assert_eq!(answer_header.kind, PacketKind::Reset);
        assert_eq!(answer_header.connection_id, 77);
        assert_eq!(host.connection_count(), 0);
    }

    #[test]
    fn test_global_rate_limit_defers_traffic() {
        let mut config = Config::default();
        config.global_rate_limit = 2000;
        let (mut client, mut server) = pair(config);
        let server_addr = server.local_addr().unwrap();

        client.connect(server_addr).unwrap();
        let mut now = Instant::now();
        settle(&mut client, &mut server, now);
        while client.recv().is_some() {}

        // Far more than one interval's budget.
        let message = vec![7u8; 10_000];
        assert_eq!(client.send(server_addr, &message).unwrap(), 10_000);

        let data_frames_sent = |host: &mut Host<MemoryTransport>| {
            host.transport_mut()
                .outbox
                .iter()
                .filter(|(_, frame)| {
                    matches!(PacketHeader::decode(frame), Ok((h, _)) if h.kind == PacketKind::Data)
                })
                .count()
        };

        client.tick(now);
        // One full segment fits in the 2000-byte budget; the rest is parked.
        assert_eq!(data_frames_sent(&mut client), 1);

        // Nothing more goes out until the quota refills.
        client.tick(now);
        assert_eq!(data_frames_sent(&mut client), 1);

        now += REFILL_INTERVAL;
        client.tick(now);
        assert_eq!(data_frames_sent(&mut client), 2);
    }

    #[test]
    fn test_event_buffer_bounds_pending_events() {
        let mut config = Config::default();
        config.event_buffer_size = 1;
        let (mut client, mut server) = pair(config);
        let server_addr = server.local_addr().unwrap();
        let client_addr = client.local_addr().unwrap();

        client.connect(server_addr).unwrap();
        let now = Instant::now();
        settle(&mut client, &mut server, now);

        // Connected fills the single-slot buffer, so the data event that
        // arrives before anyone reads is dropped.
        assert_eq!(client.send(server_addr, b"first").unwrap(), 5);
        settle(&mut client, &mut server, now);
        assert_eq!(server.recv(), Some(HostEvent::Connected(client_addr)));
        assert_eq!(server.recv(), None);

        // With the buffer drained, delivery resumes.
        assert_eq!(client.send(server_addr, b"second").unwrap(), 6);
        settle(&mut client, &mut server, now);
        assert_eq!(
            server.recv(),
            Some(HostEvent::Data(client_addr, b"second".to_vec()))
        );
    }

    #[test]
    fn test_peer_channel_recycled_after_close() {
        let (mut client, mut server) = pair(Config::default());
        let server_addr = server.local_addr().unwrap();

        client.connect(server_addr).unwrap();
        let now = Instant::now();
        settle(&mut client, &mut server, now);

        client.abort(server_addr);
        settle(&mut client, &mut server, now);
        assert_eq!(client.connection_count(), 0);
        assert_eq!(client.free_channels.len(), 1);
        let recycled = client.free_channels[0];

        // The next connection takes the freed channel instead of growing.
        client.connect(server_addr).unwrap();
        assert_eq!(client.peer_channels[&server_addr], recycled);
        assert!(client.free_channels.is_empty());
    }
}
