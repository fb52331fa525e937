//! Observed peer liveness.

use crate::timeouts::Timeouts;

/// What the host-status monitor last saw in a peer's delta-lease sector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStatus {
    pub owner_id: u64,
    pub owner_generation: u64,
    pub timestamp: u64,
    /// The peer's published i/o timeout; its death is judged against this,
    /// never against ours.
    pub io_timeout: u32,
    /// Monotonic time we last read the sector.
    pub last_check: u64,
    /// Monotonic time we last observed the sector change.
    pub last_live: u64,
}

impl HostStatus {
    /// Whether our monitor saw the peer alive on its most recent pass.
    pub fn live_on_last_check(&self) -> bool {
        self.last_live != 0 && self.last_check == self.last_live
    }

    /// A peer is only possibly dead once it has been silent for its own
    /// host-dead interval.
    pub fn maybe_dead(&self, now: u64, timeouts: &Timeouts) -> bool {
        now.saturating_sub(self.last_live) > timeouts.host_dead_seconds(self.io_timeout)
    }

    pub fn matches_owner(&self, owner_id: u64, owner_generation: u64) -> bool {
        self.owner_id == owner_id && self.owner_generation == owner_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maybe_dead_uses_peer_timeout() {
        let timeouts = Timeouts::new(10);
        let hs = HostStatus {
            owner_id: 5,
            owner_generation: 2,
            io_timeout: 5,
            last_check: 1000,
            last_live: 1000,
            ..Default::default()
        };
        // peer timeout 5 => dead after 40 silent seconds, not 80
        assert!(!hs.maybe_dead(1040, &timeouts));
        assert!(hs.maybe_dead(1041, &timeouts));
    }

    #[test]
    fn test_live_on_last_check() {
        let mut hs = HostStatus {
            last_check: 50,
            last_live: 50,
            ..Default::default()
        };
        assert!(hs.live_on_last_check());
        hs.last_check = 60;
        assert!(!hs.live_on_last_check());
    }
}
