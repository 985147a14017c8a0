//! Packet types and wire header codec.
//!
//! Every datagram starts with a fixed 12-byte header:
//!
//! ```text
//! | kind (1) | version (1) | connection_id (2) | sequence (2) | ack (2) | window (4) |
//! ```
//!
//! followed by the payload for DATA packets. Multi-byte fields are big
//! endian. Sequence arithmetic is modulo 65536; the canonical ordering test
//! is the signed 16-bit difference, never naive unsigned comparison.

use std::{
    convert::TryFrom,
    io::{Cursor, Write},
    time::Instant,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use microtp_core::{
    constants::{HEADER_SIZE, PROTOCOL_VERSION},
    error::{ErrorKind, Result},
    packet_pool::PoolBuffer,
};

/// 16-bit sequence number type used by the protocol.
pub type SequenceNumber = u16;

/// Returns true if sequence `a` is strictly after `b`, modulo 65536.
///
/// `sequence_after(0, 65535)` is true: 0 is the successor of 65535.
pub fn sequence_after(a: SequenceNumber, b: SequenceNumber) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

/// Returns the signed distance from `b` to `a`, modulo 65536.
///
/// Positive when `a` is ahead of `b`, negative when behind. Two numbers
/// exactly half the space apart are unordered and return `i16::MIN`.
pub fn sequence_distance(a: SequenceNumber, b: SequenceNumber) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Id to identify a packet's role in the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    /// Connection request; consumes the initiator's first sequence number.
    Syn = 0,
    /// An application data segment.
    Data = 1,
    /// State announcement carrying an acknowledgment; consumes no sequence.
    State = 2,
    /// Graceful end of stream; consumes a sequence number.
    Fin = 3,
    /// Abortive close; forces the receiver to `Closed` immediately.
    Reset = 4,
}

impl PacketKind {
    /// Converts the kind to its wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Returns true if packets of this kind occupy a sequence number and
    /// are retransmitted until acknowledged.
    pub fn consumes_sequence(self) -> bool {
        matches!(self, PacketKind::Syn | PacketKind::Data | PacketKind::Fin)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = ErrorKind;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketKind::Syn),
            1 => Ok(PacketKind::Data),
            2 => Ok(PacketKind::State),
            3 => Ok(PacketKind::Fin),
            4 => Ok(PacketKind::Reset),
            other => Err(ErrorKind::CouldNotReadHeader(format!("Unknown packet kind {}", other))),
        }
    }
}

/// The decoded fixed header of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// The packet's role.
    pub kind: PacketKind,
    /// Connection identifier chosen by the initiator during handshake.
    pub connection_id: u16,
    /// Sequence number of this packet (for kinds that consume one), or the
    /// sender's next sequence number (for STATE).
    pub sequence: SequenceNumber,
    /// Cumulative acknowledgment: every sequence up to and including this
    /// value has been received.
    pub ack_sequence: SequenceNumber,
    /// Receive window the sender is prepared to accept, in bytes.
    pub window: u32,
}

impl PacketHeader {
    /// Encodes the header into `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        // Writes to a Vec cannot fail.
        out.push(self.kind.to_u8());
        out.push(PROTOCOL_VERSION);
        out.write_u16::<BigEndian>(self.connection_id).expect("vec write");
        out.write_u16::<BigEndian>(self.sequence).expect("vec write");
        out.write_u16::<BigEndian>(self.ack_sequence).expect("vec write");
        out.write_u32::<BigEndian>(self.window).expect("vec write");
    }

    /// Decodes a header from the front of `bytes`, returning it together
    /// with the remaining payload.
    pub fn decode(bytes: &[u8]) -> Result<(PacketHeader, &[u8])> {
        if bytes.len() < HEADER_SIZE {
            return Err(ErrorKind::CouldNotReadHeader(format!(
                "Datagram of {} bytes is shorter than the {}-byte header",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let kind = PacketKind::try_from(bytes[0])?;
        let version = bytes[1];
        if version != PROTOCOL_VERSION {
            return Err(ErrorKind::CouldNotReadHeader(format!(
                "Unsupported protocol version {}",
                version
            )));
        }
        let mut reader = Cursor::new(&bytes[2..HEADER_SIZE]);
        let connection_id = reader
            .read_u16::<BigEndian>()
            .map_err(|e| ErrorKind::CouldNotReadHeader(e.to_string()))?;
        let sequence = reader
            .read_u16::<BigEndian>()
            .map_err(|e| ErrorKind::CouldNotReadHeader(e.to_string()))?;
        let ack_sequence = reader
            .read_u16::<BigEndian>()
            .map_err(|e| ErrorKind::CouldNotReadHeader(e.to_string()))?;
        let window = reader
            .read_u32::<BigEndian>()
            .map_err(|e| ErrorKind::CouldNotReadHeader(e.to_string()))?;

        Ok((
            PacketHeader { kind, connection_id, sequence, ack_sequence, window },
            &bytes[HEADER_SIZE..],
        ))
    }
}

/// A single protocol segment.
///
/// Created with storage obtained from the packet pool; owned exclusively by
/// whichever window slot holds it, or by the socket while it is being
/// constructed or transmitted. The payload storage is returned to the pool
/// exactly once, when the packet is acknowledged, delivered, or the socket
/// shuts down.
#[derive(Debug)]
pub struct Packet {
    /// The packet's role.
    pub kind: PacketKind,
    /// Sequence number assigned to this packet.
    pub sequence: SequenceNumber,
    /// Pooled payload storage. Empty for control packets.
    pub payload: PoolBuffer,
    /// When this packet was last transmitted, if ever.
    pub send_time: Option<Instant>,
    /// How many times this packet has been retransmitted.
    pub retransmit_count: u32,
}

impl Packet {
    /// Creates a packet around pooled payload storage.
    pub fn new(kind: PacketKind, sequence: SequenceNumber, payload: PoolBuffer) -> Self {
        Self { kind, sequence, payload, send_time: None, retransmit_count: 0 }
    }

    /// Returns the payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Returns the size of this packet on the wire (header plus payload).
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encodes this packet, with the given acknowledgment state, into a
    /// fresh datagram.
    pub fn encode(&self, connection_id: u16, ack_sequence: SequenceNumber, window: u32) -> Vec<u8> {
        let header = PacketHeader {
            kind: self.kind,
            connection_id,
            sequence: self.sequence,
            ack_sequence,
            window,
        };
        let mut out = Vec::with_capacity(self.wire_len());
        header.encode_into(&mut out);
        out.write_all(self.payload.as_slice()).expect("vec write");
        out
    }

    /// Consumes the packet and returns its pooled storage for release.
    pub fn into_storage(self) -> PoolBuffer {
        self.payload
    }
}
