//! # paxos-lease
//!
//! The Disk-Paxos resource-lease engine. Ownership of a named resource is
//! committed to a leader sector by a two-phase ballot over per-host dblocks;
//! a dead owner's lease may be seized only after the delta-lease engine can
//! prove the owner missed its own fencing deadline.
//!
//! The engine is careful about partial failure: any failure after a phase-2
//! dblock has been written means another host may adopt and commit our
//! proposal, so the token is flagged for retraction and the release path
//! re-verifies the leader before the operation is considered finished.

pub mod acquire;
pub mod ballot;
pub mod disk;
pub mod errors;
pub mod init;
pub mod mode;
pub mod release;
pub mod request;
pub mod token;

#[cfg(test)]
pub(crate) mod testutil;

pub use acquire::{acquire, AcquireOptions};
pub use disk::leader_read;
pub use errors::{Error, Result};
pub use init::init;
pub use mode::{acquire_shared, clear_shared, read_mode_blocks, set_shared};
pub use release::{erase_dblock, release};
pub use request::{request_read, request_write};
pub use token::Token;

use async_trait::async_trait;
use delta_lease::{DeltaDisk, HostStatus};

/// What the paxos engine needs to know about host liveness. Implemented by
/// the daemon's lockspace registry; tests substitute fakes.
#[async_trait]
pub trait HostLiveness: Send + Sync {
    /// The monitor's latest view of `host_id` in `space_name`.
    async fn host_info(&self, space_name: &str, host_id: u64) -> Option<HostStatus>;

    /// The lockspace's delta-lease area, for direct rereads of an owner's
    /// sector during the wait-for-dead loop.
    async fn lockspace_disk(&self, space_name: &str) -> Option<DeltaDisk>;
}
