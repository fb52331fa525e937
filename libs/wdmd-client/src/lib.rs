//! # wdmd-client
//!
//! Client for the local watchdog multiplexer daemon. Each connection
//! registers under a name and keeps one pet timer alive with
//! `test_live(renew, expire)` calls; missing the expiry lets the hardware
//! watchdog fire and reset the host. That reset is what makes it safe for a
//! peer to seize a silent host's leases, so the renewal worker must only
//! ever arm deadlines it has actually met on disk.

pub mod client;
pub mod errors;

pub use client::{NullWatchdog, WdmdClient};
pub use errors::{Error, Result};

use async_trait::async_trait;

/// Status reported by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WdmdStatus {
    /// How often the multiplexer pets the hardware device, seconds.
    pub test_interval: u32,
    /// Seconds after a missed expiry before the hardware fires.
    pub fire_timeout: u32,
    /// Monotonic time of the last keepalive written to the device.
    pub last_keepalive: u64,
}

/// The fencing contract between a lockspace renewal worker and the
/// watchdog: after `arm(renew, expire)` returns, the hardware resets the
/// host no later than `expire + fire_timeout` unless a later deadline is
/// armed first.
#[async_trait]
pub trait WatchdogLink: Send + Sync + 'static {
    /// Pet the timer: the renewal at `renew_ts` succeeded and the next one
    /// is due before `expire_ts`.
    async fn arm(&self, renew_ts: u64, expire_ts: u64) -> Result<()>;

    /// Withdraw the pet timer (an orderly lockspace release).
    async fn disarm(&self) -> Result<()>;

    async fn status(&self) -> Result<WdmdStatus>;
}
