//! # delta-lease
//!
//! The liveness half of the lease manager. Every host in a lockspace owns
//! one sector of the delta-lease area and proves it is alive by periodically
//! rewriting that sector's timestamp. Peers never assert liveness, they
//! observe it: a host is only treated as possibly dead once its timestamp
//! has been silent for the host-dead interval derived from the host's own
//! published i/o timeout.
//!
//! The renewal worker is also the watchdog-arming authority. A deadline is
//! armed only after the renewal it covers has completed on disk, so a host
//! that stops renewing is guaranteed to be reset before any peer's
//! host-dead interval can elapse.

pub mod clock;
pub mod errors;
pub mod lease;
pub mod lockspace;
pub mod status;
pub mod timeouts;

pub use clock::monotime;
pub use errors::{Error, Result};
pub use lease::DeltaDisk;
pub use lockspace::Lockspace;
pub use status::HostStatus;
pub use timeouts::Timeouts;
