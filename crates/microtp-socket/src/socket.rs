//! The transport socket state machine.

use std::{collections::VecDeque, net::SocketAddr, time::Instant};

use microtp_core::{
    config::Config,
    constants::HEADER_SIZE,
    error::{ErrorKind, Result},
    packet_pool::PacketPool,
};
use microtp_protocol::{
    congestion::{is_overdue, CongestionController, WindowCongestion},
    packet::{sequence_distance, Packet, PacketHeader, PacketKind, SequenceNumber},
    packet_buffer::PacketBuffer,
};

use crate::{
    state::{CloseReason, SocketState},
    statistics::SocketStatistics,
};

/// Initial window storage; grows by doubling as traffic demands.
const INITIAL_WINDOW_CAPACITY: usize = 32;

/// A single reliable, ordered connection over an unreliable datagram
/// substrate.
///
/// The socket owns no I/O and no clock: the host feeds it inbound datagrams
/// through [`handle_datagram`](Self::handle_datagram), drives timers through
/// [`tick`](Self::tick), and drains outbound frames through
/// [`transmit_next`](Self::transmit_next) and
/// [`take_control_frame`](Self::take_control_frame). Payload storage comes
/// from the host's shared [`PacketPool`], passed into every method that
/// allocates or releases.
///
/// Sequenced frames (SYN, DATA, FIN) sit in the transmit queue until the
/// host grants bandwidth for them; STATE and RESET frames are control
/// traffic and bypass admission entirely.
pub struct TransportSocket {
    remote_address: SocketAddr,
    config: Config,
    state: SocketState,
    close_reason: Option<CloseReason>,
    connection_id: u16,

    /// First sequence number this side consumed (its SYN, when initiating).
    initial_sequence: SequenceNumber,
    /// Next sequence number to assign to an outbound sequenced packet.
    next_sequence: SequenceNumber,

    /// In-flight and queued outbound packets, cursor at the oldest unacked.
    send_window: PacketBuffer<Packet>,
    /// Out-of-order inbound packets, cursor at the next expected sequence.
    receive_window: PacketBuffer<Packet>,
    /// Whether the receive cursor has been anchored from the handshake.
    receive_anchored: bool,
    /// Bytes held in the receive window and the delivered queue, counted
    /// against the advertised window.
    receive_buffered: u32,

    /// Receive window last advertised by the peer, in bytes.
    peer_window: u32,
    /// Wire bytes of every packet in the send window.
    in_flight_bytes: u32,

    congestion: Box<dyn CongestionController>,
    statistics: SocketStatistics,

    /// Sequences awaiting (re)transmission, oldest first.
    transmit_queue: VecDeque<SequenceNumber>,
    /// Encoded STATE and RESET frames ready to send.
    control_queue: VecDeque<Vec<u8>>,
    /// In-order payloads ready for the application.
    delivered: VecDeque<Vec<u8>>,

    /// Bandwidth already granted by the host and not yet spent.
    bandwidth_credit: u32,
    /// Whether a bandwidth request is parked in the manager's queue.
    admission_pending: bool,

    /// An acknowledgment is owed to the peer.
    ack_due: bool,
    /// Sequence number consumed by the peer's FIN, once seen.
    peer_fin: Option<SequenceNumber>,
    /// The peer's stream is fully delivered up to and including its FIN.
    peer_fin_complete: bool,

    last_receive_time: Instant,
}

impl TransportSocket {
    /// Creates an idle socket for the given peer with the default
    /// congestion policy.
    pub fn new(remote_address: SocketAddr, config: &Config, now: Instant) -> Self {
        Self::with_controller(remote_address, config, Box::new(WindowCongestion::new(config)), now)
    }

    /// Creates an idle socket with a caller-supplied congestion policy.
    pub fn with_controller(
        remote_address: SocketAddr,
        config: &Config,
        congestion: Box<dyn CongestionController>,
        now: Instant,
    ) -> Self {
        Self {
            remote_address,
            config: config.clone(),
            state: SocketState::Idle,
            close_reason: None,
            connection_id: 0,
            initial_sequence: 0,
            next_sequence: 0,
            send_window: PacketBuffer::new(INITIAL_WINDOW_CAPACITY),
            receive_window: PacketBuffer::new(INITIAL_WINDOW_CAPACITY),
            receive_anchored: false,
            receive_buffered: 0,
            peer_window: u32::MAX,
            in_flight_bytes: 0,
            congestion,
            statistics: SocketStatistics::default(),
            transmit_queue: VecDeque::new(),
            control_queue: VecDeque::new(),
            delivered: VecDeque::new(),
            bandwidth_credit: 0,
            admission_pending: false,
            ack_due: false,
            peer_fin: None,
            peer_fin_complete: false,
            last_receive_time: now,
        }
    }

    /// The peer this socket talks to.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Why the socket closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// The connection identifier negotiated during the handshake.
    pub fn connection_id(&self) -> u16 {
        self.connection_id
    }

    /// Traffic counters.
    pub fn statistics(&self) -> &SocketStatistics {
        &self.statistics
    }

    /// Current smoothed round-trip time estimate.
    pub fn rtt(&self) -> std::time::Duration {
        self.congestion.rtt()
    }

    /// Begins the handshake as the initiating side.
    pub fn connect(&mut self, pool: &mut PacketPool) -> Result<()> {
        if self.state != SocketState::Idle {
            return Err(ErrorKind::ProtocolViolation("connect on a non-idle socket"));
        }
        self.connection_id = rand::random();
        let isn: SequenceNumber = rand::random();
        self.initial_sequence = isn;
        self.next_sequence = isn;
        self.send_window.reset_cursor(isn);

        let storage = pool.acquire(0)?;
        self.enqueue_sequenced(PacketKind::Syn, storage, pool)?;
        self.state = SocketState::SynSent;
        tracing::debug!(
            "Connecting to {} with connection id {}",
            self.remote_address,
            self.connection_id
        );
        Ok(())
    }

    /// Queues application data for transmission.
    ///
    /// Segments the input at the MTU ceiling and accepts as many segments
    /// as the congestion window and the peer's advertised window allow.
    /// Returns the number of bytes accepted; zero while the handshake is
    /// still in flight.
    pub fn write(&mut self, data: &[u8], pool: &mut PacketPool) -> Result<usize> {
        if self.state.is_closed() || self.state == SocketState::FinSent {
            return Err(ErrorKind::ProtocolViolation("write on a closing socket"));
        }
        if !self.state.can_send() {
            return Ok(0);
        }

        let mss = (self.config.mtu_ceiling as usize).saturating_sub(HEADER_SIZE).max(1);
        let mut accepted = 0;
        while accepted < data.len() {
            if self.send_window.len() as u32 >= self.congestion.window_packets() {
                break;
            }
            let segment_len = (data.len() - accepted).min(mss);
            let wire_len = (HEADER_SIZE + segment_len) as u32;
            // Always allow one segment in flight so a zero peer window
            // cannot deadlock the connection.
            if self.in_flight_bytes > 0
                && self.in_flight_bytes.saturating_add(wire_len) > self.peer_window
            {
                break;
            }

            let mut storage = pool.acquire(segment_len)?;
            storage.write(&data[accepted..accepted + segment_len]);
            self.enqueue_sequenced(PacketKind::Data, storage, pool)?;
            accepted += segment_len;
        }
        Ok(accepted)
    }

    /// Begins a graceful shutdown.
    ///
    /// Queues a FIN after any pending data. Data already received remains
    /// readable; further writes are rejected.
    pub fn close(&mut self, pool: &mut PacketPool) -> Result<()> {
        match self.state {
            SocketState::Idle => {
                self.finish(CloseReason::Graceful, pool);
                Ok(())
            }
            SocketState::SynSent | SocketState::SynReceived => {
                self.abort(pool);
                Ok(())
            }
            SocketState::Connected | SocketState::FinReceived => {
                let storage = pool.acquire(0)?;
                self.enqueue_sequenced(PacketKind::Fin, storage, pool)?;
                self.state = SocketState::FinSent;
                Ok(())
            }
            SocketState::FinSent | SocketState::Closed => Ok(()),
        }
    }

    /// Abortively closes the connection, telling the peer via RESET.
    pub fn abort(&mut self, pool: &mut PacketPool) {
        if self.state.is_closed() {
            return;
        }
        self.queue_control_frame(PacketKind::Reset);
        self.finish(CloseReason::Graceful, pool);
    }

    /// Processes one inbound datagram.
    ///
    /// Errors surface malformed headers and protocol violations; the
    /// socket has already protected itself (a violation closes it and
    /// queues a RESET) by the time an error is returned.
    pub fn handle_datagram(
        &mut self,
        bytes: &[u8],
        pool: &mut PacketPool,
        now: Instant,
    ) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        let (header, payload) = PacketHeader::decode(bytes)?;

        if header.kind == PacketKind::Reset {
            tracing::debug!("Peer {} sent RESET", self.remote_address);
            self.finish(CloseReason::PeerReset, pool);
            return Ok(());
        }
        if self.state == SocketState::Idle && header.kind != PacketKind::Syn {
            return Ok(());
        }
        if self.state != SocketState::Idle && header.connection_id != self.connection_id {
            tracing::debug!(
                "Dropping datagram with connection id {} (expected {})",
                header.connection_id,
                self.connection_id
            );
            return Ok(());
        }

        self.last_receive_time = now;
        self.peer_window = header.window;
        self.statistics.packets_received += 1;
        self.statistics.bytes_received += bytes.len() as u64;

        match header.kind {
            PacketKind::Syn => self.handle_syn(&header),
            PacketKind::State => {
                self.process_ack(header.ack_sequence, now, pool);
                self.confirm_establishment(&header);
            }
            PacketKind::Data | PacketKind::Fin => {
                self.process_ack(header.ack_sequence, now, pool);
                self.confirm_establishment(&header);
                self.handle_sequenced(&header, payload, pool)?;
            }
            PacketKind::Reset => unreachable!("handled above"),
        }

        if self.ack_due && self.receive_anchored && !self.state.is_closed() {
            self.queue_control_frame(PacketKind::State);
            self.ack_due = false;
        }
        self.maybe_finish(pool);
        Ok(())
    }

    /// Drives timers: retransmission and the idle timeout.
    pub fn tick(&mut self, now: Instant, pool: &mut PacketPool) {
        if self.state.is_closed() {
            return;
        }
        if self.state != SocketState::Idle
            && now.duration_since(self.last_receive_time) >= self.config.idle_connection_timeout
        {
            tracing::debug!("Peer {} timed out", self.remote_address);
            self.finish(CloseReason::Timeout, pool);
            return;
        }

        let send_window = &self.send_window;
        let congestion = &self.congestion;
        let config = &self.config;
        let overdue: Vec<SequenceNumber> = send_window
            .occupied_sequences()
            .filter(|sequence| {
                let packet = match send_window.at(*sequence) {
                    Some(packet) => packet,
                    None => return false,
                };
                let sent = match packet.send_time {
                    Some(sent) => sent,
                    // Already queued for (re)transmission.
                    None => return false,
                };
                if packet.kind == PacketKind::Syn {
                    // Handshake pacing is configured, not RTT-derived.
                    let shift = packet.retransmit_count.min(6);
                    let deadline = config.connect_retry_interval.saturating_mul(1 << shift);
                    return now.duration_since(sent) >= deadline;
                }
                is_overdue(congestion.as_ref(), sent, packet.retransmit_count, now)
            })
            .collect();

        if !overdue.is_empty() {
            self.congestion.on_loss();
            self.statistics.packets_lost += overdue.len() as u64;
        }
        // Requeue ahead of fresh data, oldest first.
        for sequence in overdue.into_iter().rev() {
            if let Some(packet) = self.send_window.at_mut(sequence) {
                packet.send_time = None;
                packet.retransmit_count += 1;
            }
            self.transmit_queue.push_front(sequence);
            self.statistics.retransmits += 1;
        }
    }

    /// Returns the wire length of the next queued sequenced frame, if any.
    ///
    /// The host uses this to size its bandwidth request before committing
    /// to a transmission.
    pub fn next_transmit_len(&mut self) -> Option<usize> {
        loop {
            let sequence = *self.transmit_queue.front()?;
            match self.send_window.at(sequence) {
                Some(packet) => return Some(packet.wire_len()),
                // Acknowledged before it was ever sent.
                None => {
                    self.transmit_queue.pop_front();
                }
            }
        }
    }

    /// Encodes and dequeues the next sequenced frame, stamping its send
    /// time. Bandwidth accounting is the caller's responsibility.
    pub fn transmit_next(&mut self, now: Instant) -> Option<Vec<u8>> {
        let sequence = loop {
            let sequence = *self.transmit_queue.front()?;
            if self.send_window.at(sequence).is_some() {
                break sequence;
            }
            self.transmit_queue.pop_front();
        };
        self.transmit_queue.pop_front();

        let connection_id = self.connection_id;
        let ack_sequence = self.current_ack();
        let window = self.advertised_window();
        let packet = self.send_window.at_mut(sequence)?;
        packet.send_time = Some(now);
        let frame = packet.encode(connection_id, ack_sequence, window);

        self.statistics.packets_sent += 1;
        self.statistics.bytes_sent += frame.len() as u64;
        // The acknowledgment rides along on this frame.
        self.ack_due = false;
        Some(frame)
    }

    /// Dequeues the next control frame (STATE or RESET), if any.
    ///
    /// Control frames bypass bandwidth admission and remain drainable
    /// after the socket closes, so the final acknowledgment of a FIN
    /// exchange still reaches the peer.
    pub fn take_control_frame(&mut self) -> Option<Vec<u8>> {
        self.control_queue.pop_front()
    }

    /// Dequeues the next in-order payload delivered to the application.
    pub fn take_delivered(&mut self) -> Option<Vec<u8>> {
        let payload = self.delivered.pop_front()?;
        self.receive_buffered = self.receive_buffered.saturating_sub(payload.len() as u32);
        Some(payload)
    }

    /// Bandwidth granted by the host and not yet spent.
    pub fn bandwidth_credit(&self) -> u32 {
        self.bandwidth_credit
    }

    /// Credits a bandwidth grant to this socket.
    pub fn grant_credit(&mut self, amount: u32) {
        self.bandwidth_credit = self.bandwidth_credit.saturating_add(amount);
        self.admission_pending = false;
    }

    /// Spends bandwidth credit for a transmitted frame.
    pub fn consume_credit(&mut self, amount: u32) {
        self.bandwidth_credit = self.bandwidth_credit.saturating_sub(amount);
    }

    /// Whether a bandwidth request is parked with the manager.
    pub fn admission_pending(&self) -> bool {
        self.admission_pending
    }

    /// Marks a bandwidth request as parked; cleared by the next grant.
    pub fn set_admission_pending(&mut self) {
        self.admission_pending = true;
    }

    fn current_ack(&self) -> SequenceNumber {
        if self.receive_anchored {
            self.receive_window.cursor().wrapping_sub(1)
        } else {
            0
        }
    }

    fn advertised_window(&self) -> u32 {
        self.config.receive_window_size.saturating_sub(self.receive_buffered)
    }

    /// Assigns the next sequence number, inserts the packet into the send
    /// window, and queues it for transmission.
    fn enqueue_sequenced(
        &mut self,
        kind: PacketKind,
        payload: microtp_core::packet_pool::PoolBuffer,
        pool: &mut PacketPool,
    ) -> Result<SequenceNumber> {
        let sequence = self.next_sequence;
        let packet = Packet::new(kind, sequence, payload);
        self.in_flight_bytes = self.in_flight_bytes.saturating_add(packet.wire_len() as u32);
        // A fresh sequence number never collides with a live slot.
        if let Some(stale) = self.send_window.insert(sequence, packet)? {
            pool.release(stale.into_storage());
        }
        self.transmit_queue.push_back(sequence);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(sequence)
    }

    fn handle_syn(&mut self, header: &PacketHeader) {
        match self.state {
            SocketState::Idle => {
                self.connection_id = header.connection_id;
                let isn: SequenceNumber = rand::random();
                self.initial_sequence = isn;
                self.next_sequence = isn;
                self.send_window.reset_cursor(isn);
                // The SYN consumes the peer's first sequence number.
                self.receive_window.reset_cursor(header.sequence.wrapping_add(1));
                self.receive_anchored = true;
                self.state = SocketState::SynReceived;
                self.ack_due = true;
                tracing::debug!(
                    "Accepting connection {} from {}",
                    self.connection_id,
                    self.remote_address
                );
            }
            // A retransmitted SYN means our STATE was lost; re-acknowledge.
            SocketState::SynReceived | SocketState::Connected => {
                self.ack_due = true;
            }
            _ => {
                tracing::debug!("Ignoring SYN in state {:?}", self.state);
            }
        }
    }

    /// Completes the handshake once the peer has proven it holds both the
    /// connection id and our sequence space.
    fn confirm_establishment(&mut self, header: &PacketHeader) {
        match self.state {
            SocketState::SynSent => {
                // Our SYN leaves the send window only when acknowledged.
                if self.send_window.at(self.initial_sequence).is_none() {
                    // For STATE the sequence field names the peer's next
                    // sequence; the first data packet will carry it.
                    if !self.receive_anchored {
                        self.receive_window.reset_cursor(header.sequence);
                        self.receive_anchored = true;
                    }
                    self.state = SocketState::Connected;
                    self.ack_due = true;
                    tracing::debug!("Connection {} established", self.connection_id);
                }
            }
            SocketState::SynReceived => {
                self.state = SocketState::Connected;
                tracing::debug!("Connection {} established", self.connection_id);
            }
            _ => {}
        }
    }

    /// Removes every packet the cumulative acknowledgment covers from the
    /// send window, feeding RTT samples and the congestion policy.
    fn process_ack(&mut self, ack_sequence: SequenceNumber, now: Instant, pool: &mut PacketPool) {
        let mut newly_acked = 0u32;
        while !self.send_window.is_empty() {
            let cursor = self.send_window.cursor();
            if sequence_distance(ack_sequence, cursor) < 0 {
                break;
            }
            if let Some(packet) = self.send_window.pop_front() {
                // Karn's rule: only never-retransmitted packets give an
                // unambiguous RTT sample.
                if packet.retransmit_count == 0 {
                    if let Some(sent) = packet.send_time {
                        self.congestion.update_rtt(now.duration_since(sent));
                    }
                }
                if packet.send_time.is_none() {
                    // Acked while still queued; drop the pending send.
                    self.transmit_queue.retain(|queued| *queued != cursor);
                }
                self.in_flight_bytes =
                    self.in_flight_bytes.saturating_sub(packet.wire_len() as u32);
                newly_acked += 1;
                pool.release(packet.into_storage());
            }
        }
        if newly_acked > 0 {
            self.congestion.on_ack(newly_acked);
        }
    }

    /// Admits a sequenced DATA or FIN packet into the receive window and
    /// delivers everything now contiguous.
    fn handle_sequenced(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        pool: &mut PacketPool,
    ) -> Result<()> {
        if !self.receive_anchored {
            self.receive_window.reset_cursor(header.sequence);
            self.receive_anchored = true;
        }
        let sequence = header.sequence;
        self.ack_due = true;

        // Behind the cursor: already delivered. Re-acknowledge so the peer
        // stops retransmitting, but never deliver twice.
        if sequence_distance(sequence, self.receive_window.cursor()) < 0 {
            self.statistics.duplicates_received += 1;
            return Ok(());
        }

        if let Some(fin) = self.peer_fin {
            if header.kind == PacketKind::Data && sequence_distance(sequence, fin) >= 0 {
                return self.protocol_violation("data at or beyond the peer's fin", pool);
            }
        }
        if header.kind == PacketKind::Fin {
            match self.peer_fin {
                Some(existing) if existing != sequence => {
                    return self.protocol_violation("conflicting fin sequences", pool);
                }
                _ => self.peer_fin = Some(sequence),
            }
        }
        if payload.len() + HEADER_SIZE > self.config.mtu_ceiling as usize {
            return self.protocol_violation("segment larger than the mtu ceiling", pool);
        }
        if self
            .receive_buffered
            .saturating_add(payload.len() as u32)
            > self.config.receive_window_size
        {
            // The peer overran our advertised window; drop and let it
            // retransmit once the application drains.
            tracing::debug!("Receive window full, dropping sequence {}", sequence);
            return Ok(());
        }

        let mut storage = pool.acquire(payload.len())?;
        storage.write(payload);
        let packet = Packet::new(header.kind, sequence, storage);
        let evicted = match self.receive_window.insert_or_reject(sequence, packet) {
            Ok(evicted) => evicted,
            Err((err, rejected)) => {
                // The window rejects only sequences behind the cursor,
                // which the duplicate check above already re-acked; return
                // the storage to the pool rather than dropping it.
                pool.release(rejected.into_storage());
                return Err(err);
            }
        };
        match evicted {
            Some(previous) => {
                self.statistics.duplicates_received += 1;
                pool.release(previous.into_storage());
            }
            None => {
                self.receive_buffered =
                    self.receive_buffered.saturating_add(payload.len() as u32);
            }
        }

        self.deliver_ready(pool);
        Ok(())
    }

    /// Moves every contiguous packet from the receive window to the
    /// delivered queue, advancing the cursor.
    fn deliver_ready(&mut self, pool: &mut PacketPool) {
        while let Some(packet) = self.receive_window.pop_front() {
            match packet.kind {
                PacketKind::Data => {
                    self.delivered.push_back(packet.payload.as_slice().to_vec());
                }
                PacketKind::Fin => {
                    self.receive_buffered =
                        self.receive_buffered.saturating_sub(packet.payload_len() as u32);
                    self.peer_fin_complete = true;
                }
                _ => {}
            }
            pool.release(packet.into_storage());
        }
        if self.peer_fin_complete && self.state == SocketState::Connected {
            self.state = SocketState::FinReceived;
            tracing::debug!("Peer {} finished its stream", self.remote_address);
        }
    }

    /// Closes gracefully once both FINs are delivered and ours is acked.
    fn maybe_finish(&mut self, pool: &mut PacketPool) {
        if self.state == SocketState::FinSent
            && self.peer_fin_complete
            && self.send_window.is_empty()
        {
            self.finish(CloseReason::Graceful, pool);
        }
    }

    fn queue_control_frame(&mut self, kind: PacketKind) {
        let header = PacketHeader {
            kind,
            connection_id: self.connection_id,
            sequence: self.next_sequence,
            ack_sequence: self.current_ack(),
            window: self.advertised_window(),
        };
        let mut frame = Vec::with_capacity(HEADER_SIZE);
        header.encode_into(&mut frame);
        self.control_queue.push_back(frame);
    }

    fn protocol_violation(&mut self, detail: &'static str, pool: &mut PacketPool) -> Result<()> {
        tracing::warn!("Protocol violation from {}: {}", self.remote_address, detail);
        self.queue_control_frame(PacketKind::Reset);
        self.finish(CloseReason::ProtocolError, pool);
        Err(ErrorKind::ProtocolViolation(detail))
    }

    /// Transitions to `Closed`, returning all pooled storage.
    ///
    /// Control frames already queued stay drainable; delivered data stays
    /// readable only after a graceful close.
    fn finish(&mut self, reason: CloseReason, pool: &mut PacketPool) {
        if self.state.is_closed() {
            return;
        }
        self.state = SocketState::Closed;
        self.close_reason = Some(reason);

        for packet in self.send_window.drain_all() {
            pool.release(packet.into_storage());
        }
        for packet in self.receive_window.drain_all() {
            self.receive_buffered =
                self.receive_buffered.saturating_sub(packet.payload_len() as u32);
            pool.release(packet.into_storage());
        }
        self.transmit_queue.clear();
        self.in_flight_bytes = 0;
        self.bandwidth_credit = 0;
        self.admission_pending = false;
        if reason != CloseReason::Graceful {
            self.delivered.clear();
            self.receive_buffered = 0;
        }
        tracing::debug!("Connection to {} closed: {:?}", self.remote_address, reason);
    }
}
