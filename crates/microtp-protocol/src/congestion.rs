//! Congestion control and RTT tracking.
//!
//! The exact window growth and backoff curve is a policy decision, not part
//! of the transport contract, so it hides behind [`CongestionController`].
//! Any implementation must reduce the send rate on loss and probe upward on
//! sustained success; [`WindowCongestion`] is the default policy.

use std::time::{Duration, Instant};

use microtp_core::config::Config;

/// Pluggable congestion policy consulted by the socket.
pub trait CongestionController {
    /// Feeds an RTT sample from a freshly acknowledged, never-retransmitted
    /// packet.
    fn update_rtt(&mut self, sample: Duration);

    /// Called when `newly_acked` packets leave the send window cleanly.
    fn on_ack(&mut self, newly_acked: u32);

    /// Called once per tick in which at least one packet was declared lost.
    fn on_loss(&mut self);

    /// Returns the number of packets that may be in flight.
    fn window_packets(&self) -> u32;

    /// Returns the retransmission deadline for a packet that has already
    /// been retransmitted `retransmit_count` times.
    fn rto(&self, retransmit_count: u32) -> Duration;

    /// Returns the current smoothed round-trip time.
    fn rtt(&self) -> Duration;
}

/// Default window-based congestion control.
///
/// RTT is smoothed with an exponential weighted moving average and the
/// retransmission timeout follows the standard `RTT + 4 * variance`
/// formula, clamped to the configured bounds and doubled per retransmission
/// of the same packet. The window probes upward by roughly 1/32 per clean
/// acknowledgment round and halves on loss.
#[derive(Debug, Clone)]
pub struct WindowCongestion {
    /// Smoothed round-trip time.
    rtt: Duration,
    /// RTT variance.
    rtt_variance: Duration,
    /// Smoothing factor for RTT calculations (typically 0.1).
    rtt_alpha: f32,
    /// Variance smoothing factor (typically 0.25).
    rtt_beta: f32,
    /// Current window in packets.
    window: u32,
    min_window: u32,
    max_window: u32,
    rto_min: Duration,
    rto_max: Duration,
}

impl WindowCongestion {
    /// Creates a controller from configuration defaults.
    pub fn new(config: &Config) -> Self {
        Self {
            // Conservative guesses until the first sample arrives.
            rtt: Duration::from_millis(50),
            rtt_variance: Duration::from_millis(25),
            rtt_alpha: config.rtt_smoothing_factor,
            rtt_beta: config.rtt_variance_factor,
            window: config.initial_window_size,
            min_window: config.min_window_size,
            max_window: config.max_window_size,
            rto_min: config.retransmit_timeout_min,
            rto_max: config.retransmit_timeout_max,
        }
    }

    fn base_rto(&self) -> Duration {
        let rto = self.rtt + Duration::from_millis(4 * self.rtt_variance.as_millis() as u64);
        rto.clamp(self.rto_min, self.rto_max)
    }
}

impl CongestionController for WindowCongestion {
    fn update_rtt(&mut self, sample: Duration) {
        let sample_ms = sample.as_millis() as f32;
        let smoothed_ms = self.rtt.as_millis() as f32;

        // Each sample pulls the estimate a fraction alpha toward itself,
        // and the variance a fraction beta toward the sample's deviation.
        let next_rtt = smoothed_ms + self.rtt_alpha * (sample_ms - smoothed_ms);
        self.rtt = Duration::from_millis(next_rtt as u64);

        let deviation = (smoothed_ms - sample_ms).abs();
        let variance_ms = self.rtt_variance.as_millis() as f32;
        let next_variance = variance_ms + self.rtt_beta * (deviation - variance_ms);
        self.rtt_variance = Duration::from_millis(next_variance as u64);
    }

    fn on_ack(&mut self, newly_acked: u32) {
        // Probe upward by ~3% (1/32) per acknowledged packet round.
        let step = (self.window / 32).max(1).min(newly_acked.max(1));
        self.window = (self.window + step).min(self.max_window);
    }

    fn on_loss(&mut self) {
        self.window = (self.window / 2).max(self.min_window);
    }

    fn window_packets(&self) -> u32 {
        self.window
    }

    fn rto(&self, retransmit_count: u32) -> Duration {
        // Exponential backoff per retransmission, capped at the ceiling.
        let shift = retransmit_count.min(6);
        let backed_off = self.base_rto().saturating_mul(1 << shift);
        backed_off.min(self.rto_max)
    }

    fn rtt(&self) -> Duration {
        self.rtt
    }
}

/// Tracks the last transmission of an in-flight packet against its RTO.
///
/// Small helper shared by socket timers: a packet sent at `send_time` and
/// retransmitted `retransmit_count` times is overdue once `now` passes
/// `send_time + rto(retransmit_count)`.
pub fn is_overdue(
    controller: &dyn CongestionController,
    send_time: Instant,
    retransmit_count: u32,
    now: Instant,
) -> bool {
    now.duration_since(send_time) >= controller.rto(retransmit_count)
}
