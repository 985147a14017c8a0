use std::{default::Default, time::Duration};

use crate::constants::{DEFAULT_MTU_CEILING, DEFAULT_MTU_FLOOR};

#[derive(Clone, Debug)]
/// Configuration options to tune transport behavior.
pub struct Config {
    /// Smallest segment size the transport will use (bytes).
    pub mtu_floor: u16,
    /// Largest segment size the transport will use (bytes).
    pub mtu_ceiling: u16,
    /// Global outgoing rate limit in bytes per second (0 = unlimited).
    /// Shared by every socket in a connection group.
    pub global_rate_limit: u32,
    /// Per-peer outgoing rate limit in bytes per second (0 = unlimited).
    pub peer_rate_limit: u32,
    /// Lower bound on the retransmission timeout.
    pub retransmit_timeout_min: Duration,
    /// Upper bound on the retransmission timeout.
    pub retransmit_timeout_max: Duration,
    /// Initial congestion window size (in packets).
    pub initial_window_size: u32,
    /// Minimum congestion window size (in packets).
    pub min_window_size: u32,
    /// Maximum congestion window size (in packets).
    pub max_window_size: u32,
    /// Smoothing factor (0..1) for RTT measurements.
    pub rtt_smoothing_factor: f32,
    /// Smoothing factor (0..1) for RTT variance measurements.
    pub rtt_variance_factor: f32,
    /// Max packets retained for reuse per pool slab.
    pub pool_retained_limit: usize,
    /// Receive window advertised to the peer, in bytes.
    pub receive_window_size: u32,
    /// Max idle time before considering a connection disconnected.
    pub idle_connection_timeout: Duration,
    /// Interval between handshake retransmissions while connecting.
    pub connect_retry_interval: Duration,
    /// Max host events buffered awaiting `recv`; events arriving while the
    /// buffer is full are dropped.
    pub event_buffer_size: usize,
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to SO_RCVBUF socket option.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to SO_SNDBUF socket option.
    pub socket_send_buffer_size: Option<usize>,
    /// Time-to-live for outgoing packets (None = use system default).
    /// Corresponds to IP_TTL socket option.
    pub socket_ttl: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu_floor: DEFAULT_MTU_FLOOR,
            mtu_ceiling: DEFAULT_MTU_CEILING,
            global_rate_limit: 0,           // Unlimited
            peer_rate_limit: 0,             // Unlimited
            retransmit_timeout_min: Duration::from_millis(200),
            retransmit_timeout_max: Duration::from_secs(10),
            initial_window_size: 16,
            min_window_size: 2,
            max_window_size: 1024,
            rtt_smoothing_factor: 0.10,
            rtt_variance_factor: 0.25,
            pool_retained_limit: 64,
            receive_window_size: 1024 * 1024, // 1 MB
            idle_connection_timeout: Duration::from_secs(30),
            connect_retry_interval: Duration::from_millis(500),
            event_buffer_size: 1024,
            socket_recv_buffer_size: None, // Use system default
            socket_send_buffer_size: None, // Use system default
            socket_ttl: None,              // Use system default
        }
    }
}
