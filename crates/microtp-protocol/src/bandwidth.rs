//! Bandwidth channels and the shared bandwidth manager.
//!
//! A [`BandwidthChannel`] is a single quota counter: a byte budget per
//! refill interval. A [`BandwidthManager`] coordinates many sockets'
//! requests against one or more channels (typically one global channel for
//! the whole connection group plus one per peer), parking requests that a
//! channel cannot serve and re-offering them in arrival order on each tick.
//!
//! A request is dispatched only when *every* one of its channels grants it
//! in the same pass. The check is two-phase (verify all, then deduct all)
//! so a constrained channel never leaks quota out of an unconstrained one.

/// Identifies a registered channel within a manager.
pub type ChannelId = usize;

/// A single quota counter.
///
/// `limit` is the byte budget per refill interval; zero means unlimited
/// (every request succeeds immediately and no quota is tracked).
#[derive(Debug, Clone)]
pub struct BandwidthChannel {
    limit: u32,
    quota: u32,
}

impl BandwidthChannel {
    /// Creates a channel with the given per-interval byte limit.
    pub fn new(limit: u32) -> Self {
        Self { limit, quota: limit }
    }

    /// Creates an unconstrained channel.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Returns the configured limit (0 = unlimited).
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Returns the quota remaining in the current interval.
    pub fn quota(&self) -> u32 {
        self.quota
    }

    /// Updates the limit. Lowering the limit also clamps the remaining
    /// quota so the new budget takes effect within the current interval.
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
        if limit != 0 {
            self.quota = self.quota.min(limit);
        }
    }

    /// Returns true if this channel is not throttling.
    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    /// Checks whether `amount` bytes can be granted right now.
    pub fn can_grant(&self, amount: u32) -> bool {
        self.limit == 0 || amount <= self.quota
    }

    /// Single atomic check-and-deduct.
    ///
    /// Returns `false` if the request is granted (quota already deducted,
    /// the caller may proceed) and `true` if the caller must queue. Keeping
    /// check and consumption in one call avoids a race between "check" and
    /// "consume" when several sockets share the channel.
    pub fn need_queueing(&mut self, amount: u32) -> bool {
        if self.limit == 0 {
            return false;
        }
        if amount <= self.quota {
            self.quota -= amount;
            false
        } else {
            true
        }
    }

    /// Deducts a grant that was verified with [`can_grant`](Self::can_grant).
    ///
    /// A deduction larger than the remaining quota clamps to zero and is
    /// logged; quota never goes negative across refills.
    pub fn deduct(&mut self, amount: u32) {
        if self.limit == 0 {
            return;
        }
        if amount > self.quota {
            tracing::warn!(
                "Quota underflow: deducting {} from {} remaining; clamping to zero",
                amount,
                self.quota
            );
            self.quota = 0;
        } else {
            self.quota -= amount;
        }
    }

    /// Returns quota from an abandoned grant, bounded by the limit.
    pub fn return_quota(&mut self, amount: u32) {
        if self.limit == 0 {
            return;
        }
        self.quota = self.quota.saturating_add(amount).min(self.limit);
    }

    /// Replenishes the quota to the full limit for a new interval.
    pub fn refill(&mut self) {
        if self.limit != 0 {
            self.quota = self.limit;
        }
    }
}

/// A send request parked until its channels can all grant it.
#[derive(Debug)]
struct PendingRequest<K> {
    requester: K,
    amount: u32,
    channels: Vec<ChannelId>,
}

/// Coordinates many requesters against a set of shared channels.
///
/// Generic over the requester key so the host can use socket addresses
/// while tests use plain integers. All access is single-threaded: one
/// owning task processes every request against the shared channels, which
/// serializes quota deduction without locks.
#[derive(Debug)]
pub struct BandwidthManager<K> {
    channels: Vec<BandwidthChannel>,
    pending: std::collections::VecDeque<PendingRequest<K>>,
}

impl<K: Copy + PartialEq> BandwidthManager<K> {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self { channels: Vec::new(), pending: std::collections::VecDeque::new() }
    }

    /// Registers a channel with the given limit, returning its id.
    pub fn add_channel(&mut self, limit: u32) -> ChannelId {
        self.channels.push(BandwidthChannel::new(limit));
        self.channels.len() - 1
    }

    /// Returns a reference to a registered channel.
    pub fn channel(&self, id: ChannelId) -> &BandwidthChannel {
        &self.channels[id]
    }

    /// Returns a mutable reference to a registered channel.
    pub fn channel_mut(&mut self, id: ChannelId) -> &mut BandwidthChannel {
        &mut self.channels[id]
    }

    /// Requests permission to send `amount` bytes subject to `channels`.
    ///
    /// Returns `true` if every channel granted immediately (quota deducted).
    /// Returns `false` if any channel signalled queueing: the request is
    /// parked in arrival order and re-offered on each [`tick`](Self::tick).
    pub fn request(&mut self, requester: K, amount: u32, channels: &[ChannelId]) -> bool {
        if channels_grant_all(&mut self.channels, amount, channels) {
            return true;
        }
        self.pending.push_back(PendingRequest {
            requester,
            amount,
            channels: channels.to_vec(),
        });
        false
    }

    /// Replenishes every channel and re-offers parked requests in FIFO
    /// order.
    ///
    /// A request is dispatched only when all of its channels grant it in
    /// this pass; otherwise it keeps its place in line for the next tick.
    /// Returns `(requester, amount)` for each dispatched request so the
    /// caller can credit and wake the corresponding socket.
    pub fn tick(&mut self) -> Vec<(K, u32)> {
        for channel in &mut self.channels {
            channel.refill();
        }
        let mut granted = Vec::new();
        let mut still_pending = std::collections::VecDeque::with_capacity(self.pending.len());
        for request in self.pending.drain(..) {
            if channels_grant_all(&mut self.channels, request.amount, &request.channels) {
                granted.push((request.requester, request.amount));
            } else {
                still_pending.push_back(request);
            }
        }
        self.pending = still_pending;
        granted
    }

    /// Removes every parked request belonging to `requester`.
    ///
    /// Called when a socket closes so no dangling request refers to it.
    pub fn cancel(&mut self, requester: K) {
        self.pending.retain(|request| request.requester != requester);
    }

    /// Returns the number of parked requests.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl<K: Copy + PartialEq> Default for BandwidthManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Two-phase grant: verify every channel can grant, then deduct from all.
/// A free function so it can run while `pending` is borrowed during a tick
/// pass.
fn channels_grant_all(
    channels: &mut [BandwidthChannel],
    amount: u32,
    ids: &[ChannelId],
) -> bool {
    if !ids.iter().all(|id| channels[*id].can_grant(amount)) {
        return false;
    }
    for id in ids {
        channels[*id].deduct(amount);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_channel_never_queues() {
        let mut channel = BandwidthChannel::unlimited();
        assert!(!channel.need_queueing(u32::MAX));
        assert!(!channel.need_queueing(1));
        assert_eq!(channel.quota(), 0); // Untracked for unlimited channels.
    }

    #[test]
    fn test_need_queueing_deducts_on_grant() {
        let mut channel = BandwidthChannel::new(100);

        assert!(!channel.need_queueing(60));
        assert_eq!(channel.quota(), 40);

        // Too big: caller must queue, quota untouched.
        assert!(channel.need_queueing(50));
        assert_eq!(channel.quota(), 40);

        channel.refill();
        assert_eq!(channel.quota(), 100);
        assert!(!channel.need_queueing(50));
    }

    #[test]
    fn test_deduct_clamps_underflow() {
        let mut channel = BandwidthChannel::new(10);
        channel.deduct(25);
        assert_eq!(channel.quota(), 0);
        channel.refill();
        assert_eq!(channel.quota(), 10);
    }

    #[test]
    fn test_return_quota_bounded_by_limit() {
        let mut channel = BandwidthChannel::new(100);
        assert!(!channel.need_queueing(30));
        channel.return_quota(1000);
        assert_eq!(channel.quota(), 100);
    }

    #[test]
    fn test_set_limit_clamps_quota() {
        let mut channel = BandwidthChannel::new(100);
        channel.set_limit(20);
        assert_eq!(channel.quota(), 20);
        assert!(channel.need_queueing(25));
    }

    #[test]
    fn test_quota_conservation_within_interval() {
        let mut channel = BandwidthChannel::new(100);
        let mut granted = 0;
        for _ in 0..10 {
            if !channel.need_queueing(30) {
                granted += 30;
            }
        }
        assert!(granted <= 100);
        assert_eq!(granted, 90);
    }

    #[test]
    fn test_manager_grants_immediately_when_clear() {
        let mut manager: BandwidthManager<u32> = BandwidthManager::new();
        let global = manager.add_channel(1000);
        let peer = manager.add_channel(500);

        assert!(manager.request(1, 400, &[global, peer]));
        assert_eq!(manager.channel(global).quota(), 600);
        assert_eq!(manager.channel(peer).quota(), 100);
    }

    #[test]
    fn test_manager_queues_when_any_channel_blocks() {
        let mut manager: BandwidthManager<u32> = BandwidthManager::new();
        let global = manager.add_channel(1000);
        let peer = manager.add_channel(100);

        assert!(!manager.request(1, 400, &[global, peer]));
        // The unconstrained-enough channel must not have been charged.
        assert_eq!(manager.channel(global).quota(), 1000);
        assert_eq!(manager.pending_len(), 1);
    }

    #[test]
    fn test_tick_dispatches_in_fifo_order() {
        let mut manager: BandwidthManager<u32> = BandwidthManager::new();
        let channel = manager.add_channel(100);

        // Exhaust the interval.
        assert!(manager.request(0, 100, &[channel]));
        assert!(!manager.request(1, 60, &[channel]));
        assert!(!manager.request(2, 60, &[channel]));

        // On refill only the first parked request fits; the second keeps
        // its place for the next tick.
        let granted = manager.tick();
        assert_eq!(granted, vec![(1, 60)]);
        assert_eq!(manager.pending_len(), 1);

        let granted = manager.tick();
        assert_eq!(granted, vec![(2, 60)]);
        assert_eq!(manager.pending_len(), 0);
    }

    #[test]
    fn test_tick_skips_blocked_without_starving_later_requests() {
        let mut manager: BandwidthManager<u32> = BandwidthManager::new();
        let channel = manager.add_channel(100);

        assert!(manager.request(0, 100, &[channel]));
        assert!(!manager.request(1, 150, &[channel])); // Can never fit.
        assert!(!manager.request(2, 40, &[channel]));

        let granted = manager.tick();
        assert_eq!(granted, vec![(2, 40)]);
        assert_eq!(manager.pending_len(), 1);
    }

    #[test]
    fn test_cancel_removes_requesters_entries() {
        let mut manager: BandwidthManager<u32> = BandwidthManager::new();
        let channel = manager.add_channel(10);

        assert!(!manager.request(1, 50, &[channel]));
        assert!(!manager.request(2, 50, &[channel]));
        assert!(!manager.request(1, 50, &[channel]));
        assert_eq!(manager.pending_len(), 3);

        manager.cancel(1);
        assert_eq!(manager.pending_len(), 1);
    }

    #[test]
    fn test_spec_scenario_queue_then_refill() {
        // Channel limit 100: grant 60, queue 50, refill, queued request goes.
        let mut manager: BandwidthManager<u32> = BandwidthManager::new();
        let channel = manager.add_channel(100);

        assert!(manager.request(7, 60, &[channel]));
        assert_eq!(manager.channel(channel).quota(), 40);

        assert!(!manager.request(7, 50, &[channel]));
        assert_eq!(manager.channel(channel).quota(), 40);

        let granted = manager.tick();
        assert_eq!(granted, vec![(7, 50)]);
        assert_eq!(manager.channel(channel).quota(), 50);
    }
}
