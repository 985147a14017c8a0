#![warn(missing_docs)]

//! microtp-protocol: packet types, windows, and admission control.

/// Bandwidth channels and the shared bandwidth manager.
pub mod bandwidth;
/// Congestion control and RTT tracking.
pub mod congestion;
/// Packet types, wire header codec, and sequence arithmetic.
pub mod packet;
/// Wraparound-indexed packet window for retransmission and reassembly.
pub mod packet_buffer;

pub use bandwidth::{BandwidthChannel, BandwidthManager, ChannelId};
pub use congestion::{CongestionController, WindowCongestion};
pub use packet::{sequence_after, sequence_distance, Packet, PacketHeader, PacketKind, SequenceNumber};
pub use packet_buffer::PacketBuffer;
