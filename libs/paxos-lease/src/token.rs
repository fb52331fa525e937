//! The token: identity and disk placement for one resource lease.

use delta_lease::Timeouts;
use sector_io::SyncDisk;

use crate::errors::{Error, Result};

/// Everything a paxos operation needs to know about who is asking and
/// where the lease lives. Replicated resources list an odd number of
/// disks; operations succeed on a strict majority.
#[derive(Debug, Clone)]
pub struct Token {
    pub space_name: String,
    pub resource_name: String,
    pub disks: Vec<SyncDisk>,
    pub sector_size: u32,
    pub align_size: u64,
    pub host_id: u64,
    pub host_generation: u64,
    pub timeouts: Timeouts,
    /// Keep our SHARED mode block intact while writing dblocks (the
    /// shared-to-exclusive upgrade path).
    pub preserve_shared: bool,
    /// An incomplete acquire may have left our proposal adoptable; the
    /// release path must re-verify the leader before reporting done.
    pub retract: bool,
}

impl Token {
    pub fn new(
        space_name: impl Into<String>,
        resource_name: impl Into<String>,
        disks: Vec<SyncDisk>,
        sector_size: u32,
        host_id: u64,
        host_generation: u64,
        timeouts: Timeouts,
    ) -> Result<Token> {
        let align_size = ondisk::align_size_for_sector(sector_size)
            .ok_or(Error::Io(sector_io::Error::SectorSize(sector_size)))?;
        Ok(Token {
            space_name: space_name.into(),
            resource_name: resource_name.into(),
            disks,
            sector_size,
            align_size,
            host_id,
            host_generation,
            timeouts,
            preserve_shared: false,
            retract: false,
        })
    }

    pub fn io_timeout(&self) -> std::time::Duration {
        self.timeouts.io_timeout()
    }

    pub fn num_disks(&self) -> usize {
        self.disks.len()
    }
}
