#![warn(missing_docs)]

//! microtp-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared across all layers:
//! - Configuration types
//! - Error handling
//! - Protocol constants
//! - Memory utilities (the size-classed packet pool)
//! - The datagram transport abstraction
//!
//! Protocol-specific logic lives in specialized crates:
//! - `microtp-protocol`: packet window, bandwidth management, congestion control
//! - `microtp-socket`: the transport socket state machine
//! - `microtp-host`: connection group driving many sockets over one transport

/// Protocol constants shared across layers.
pub mod constants {
    /// The size of the fixed packet header in bytes.
    ///
    /// kind (1) + version (1) + connection id (2) + sequence (2) + ack (2) + window (4)
    pub const HEADER_SIZE: usize = 12;
    /// Allocation size of the control slab.
    ///
    /// Control packets (SYN, STATE, FIN, RESET) carry no payload; this leaves
    /// room for the header plus small protocol extensions.
    pub const CONTROL_SEGMENT_SIZE: usize = 64;
    /// Default smallest path MTU we will segment for.
    ///
    /// 576 is the minimum reassembly size every IPv4 host must accept.
    pub const DEFAULT_MTU_FLOOR: u16 = 576;
    /// Default largest path MTU we will segment for.
    ///
    /// Derived from ethernet_mtu - ipv6_header_size - udp_header_size
    ///       1452 = 1500         - 40               - 8
    pub const DEFAULT_MTU_CEILING: u16 = 1452;
    /// Half the 16-bit sequence space.
    ///
    /// Two sequence numbers further apart than this cannot be ordered, which
    /// bounds both window spans and buffer growth.
    pub const MAX_SEQUENCE_SPAN: u16 = 32768;
    /// This is the current protocol version.
    pub const PROTOCOL_VERSION: u8 = 1;
}

/// Configuration options to tune transport behavior.
pub mod config;
/// Error types and results.
pub mod error;
/// Size-classed packet pooling for allocation reuse under packet churn.
pub mod packet_pool;
/// Datagram transport abstraction for pluggable I/O.
pub mod transport;
