/// Traffic counters for a single socket.
///
/// Counters are monotonic for the lifetime of the socket; callers wanting
/// interval rates snapshot and diff them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketStatistics {
    /// Datagrams handed to the substrate for transmission.
    pub packets_sent: u64,
    /// Datagrams accepted from the substrate after header validation.
    pub packets_received: u64,
    /// Bytes handed to the substrate, headers included.
    pub bytes_sent: u64,
    /// Bytes accepted from the substrate, headers included.
    pub bytes_received: u64,
    /// Packets declared lost by the retransmission timer.
    pub packets_lost: u64,
    /// Retransmissions queued.
    pub retransmits: u64,
    /// Sequenced packets received more than once.
    pub duplicates_received: u64,
}

impl SocketStatistics {
    /// Returns the fraction of sent packets declared lost (0.0 to 1.0).
    pub fn loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / self.packets_sent as f64
    }

    /// Resets every counter to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_rate() {
        let mut stats = SocketStatistics::default();
        assert_eq!(stats.loss_rate(), 0.0);

        stats.packets_sent = 10;
        stats.packets_lost = 2;
        assert!((stats.loss_rate() - 0.2).abs() < 1e-9);

        stats.reset();
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.loss_rate(), 0.0);
    }
}
