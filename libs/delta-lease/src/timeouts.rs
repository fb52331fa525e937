//! Protocol timing. Everything is derived from the i/o timeout so that a
//! single knob keeps the renewal period, the fencing deadline and the
//! seizure window consistent with each other.

use std::time::Duration;

pub const DEFAULT_IO_TIMEOUT_SECONDS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    io_timeout_seconds: u32,
    host_dead_override: Option<u64>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts::new(DEFAULT_IO_TIMEOUT_SECONDS)
    }
}

impl Timeouts {
    pub fn new(io_timeout_seconds: u32) -> Self {
        Timeouts {
            io_timeout_seconds: io_timeout_seconds.max(1),
            host_dead_override: None,
        }
    }

    /// Shrink the host-dead wait, for test rigs that cannot afford the
    /// production-scale intervals.
    pub fn with_host_dead_override(mut self, seconds: u64) -> Self {
        self.host_dead_override = Some(seconds);
        self
    }

    pub fn io_timeout_seconds(&self) -> u32 {
        self.io_timeout_seconds
    }

    /// Deadline applied to each disk operation.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.io_timeout_seconds))
    }

    /// Period of the host_id renewal worker.
    pub fn host_id_renewal_seconds(&self) -> u64 {
        (u64::from(self.io_timeout_seconds) / 2).max(1)
    }

    /// Renewal failures past this stop the watchdog from being re-armed;
    /// the host then resets at the last armed deadline plus the fire
    /// timeout.
    pub fn host_id_renewal_fail_seconds(&self) -> u64 {
        u64::from(self.io_timeout_seconds) * 4
    }

    /// Renewal-fail window plus the watchdog fire timeout. The watchdog
    /// setup check insists these add up, which is what lets
    /// [`host_dead_seconds`](Self::host_dead_seconds) equal this value.
    pub fn host_id_timeout_seconds(&self) -> u64 {
        u64::from(self.io_timeout_seconds) * 8
    }

    /// How long a peer must be silent before it may be declared dead,
    /// judged with the peer's own published i/o timeout (zero meaning the
    /// default).
    pub fn host_dead_seconds(&self, peer_io_timeout: u32) -> u64 {
        if let Some(o) = self.host_dead_override {
            return o;
        }
        let peer = if peer_io_timeout == 0 {
            DEFAULT_IO_TIMEOUT_SECONDS
        } else {
            peer_io_timeout
        };
        u64::from(peer) * 8
    }
}
