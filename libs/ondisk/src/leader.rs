//! The leader record: the committed state of a resource lease. With the
//! delta magic the same layout serves as a host's liveness sector.

use bytes::{Buf, BufMut};

use crate::checksum::wire_checksum;
use crate::{Error, Result, NAME_SIZE};

pub const PAXOS_LEADER_MAGIC: u32 = 0x0615_2010;
/// Stamped by init in clear mode to mark an explicitly wiped area.
pub const PAXOS_LEADER_CLEAR: u32 = 0x1128_2016;
pub const PAXOS_LEADER_VERSION_MAJOR: u32 = 0x0006_0000;
pub const PAXOS_LEADER_VERSION: u32 = 0x0006_0001;

pub const DELTA_LEASE_MAGIC: u32 = 0x1221_2010;
pub const DELTA_LEASE_VERSION_MAJOR: u32 = 0x0003_0000;
pub const DELTA_LEASE_VERSION: u32 = 0x0003_0001;

/// `timestamp` value meaning "no owner".
pub const LEASE_FREE: u64 = 0;

/// Owner intends to release soon; retry instead of starting a seizure wait.
pub const LEADER_FLAG_SHORT_HOLD: u32 = 0x0000_0001;

/// Bytes covered by the checksum.
pub const LEADER_CHECKSUM_LEN: usize = 168;
/// Encoded length on disk.
pub const LEADER_ENCODED_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderRecord {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub sector_size: u32,
    pub num_hosts: u64,
    pub max_hosts: u64,
    pub owner_id: u64,
    pub owner_generation: u64,
    pub lver: u64,
    pub space_name: [u8; NAME_SIZE],
    pub resource_name: [u8; NAME_SIZE],
    pub timestamp: u64,
    /// The writer's i/o timeout in seconds; peers judge this host's death
    /// against it. Zero means "assume the default".
    pub io_timeout: u32,
    pub checksum: u32,
    pub write_id: u64,
    pub write_generation: u64,
    pub write_timestamp: u64,
}

impl Default for LeaderRecord {
    fn default() -> Self {
        LeaderRecord {
            magic: 0,
            version: 0,
            flags: 0,
            sector_size: 0,
            num_hosts: 0,
            max_hosts: 0,
            owner_id: 0,
            owner_generation: 0,
            lver: 0,
            space_name: [0; NAME_SIZE],
            resource_name: [0; NAME_SIZE],
            timestamp: 0,
            io_timeout: 0,
            checksum: 0,
            write_id: 0,
            write_generation: 0,
            write_timestamp: 0,
        }
    }
}

impl LeaderRecord {
    /// Encode into the start of `sector`, compute the checksum over the
    /// encoded bytes and stamp it both on disk form and on `self`.
    pub fn encode_into(&mut self, sector: &mut [u8]) -> Result<u32> {
        if sector.len() < LEADER_ENCODED_LEN {
            return Err(Error::Truncated {
                need: LEADER_ENCODED_LEN,
                got: sector.len(),
            });
        }
        {
            let mut b = &mut sector[..LEADER_ENCODED_LEN];
            b.put_u32_le(self.magic);
            b.put_u32_le(self.version);
            b.put_u32_le(self.flags);
            b.put_u32_le(self.sector_size);
            b.put_u64_le(self.num_hosts);
            b.put_u64_le(self.max_hosts);
            b.put_u64_le(self.owner_id);
            b.put_u64_le(self.owner_generation);
            b.put_u64_le(self.lver);
            b.put_slice(&self.space_name);
            b.put_slice(&self.resource_name);
            b.put_u64_le(self.timestamp);
            b.put_u32_le(self.io_timeout);
            b.put_u32_le(0); // reserved
            b.put_u32_le(0); // checksum, stamped below
            b.put_u32_le(0); // reserved
            b.put_u64_le(self.write_id);
            b.put_u64_le(self.write_generation);
            b.put_u64_le(self.write_timestamp);
        }
        let checksum = wire_checksum(&sector[..LEADER_CHECKSUM_LEN]);
        sector[LEADER_CHECKSUM_LEN..LEADER_CHECKSUM_LEN + 4]
            .copy_from_slice(&checksum.to_le_bytes());
        self.checksum = checksum;
        Ok(checksum)
    }

    /// Decode from `sector`, also returning the checksum computed over the
    /// raw bytes. Verifiers compare that against the stored field.
    pub fn decode_from(sector: &[u8]) -> Result<(LeaderRecord, u32)> {
        if sector.len() < LEADER_ENCODED_LEN {
            return Err(Error::Truncated {
                need: LEADER_ENCODED_LEN,
                got: sector.len(),
            });
        }
        let computed = wire_checksum(&sector[..LEADER_CHECKSUM_LEN]);
        let mut b = &sector[..LEADER_ENCODED_LEN];
        let mut lr = LeaderRecord {
            magic: b.get_u32_le(),
            version: b.get_u32_le(),
            flags: b.get_u32_le(),
            sector_size: b.get_u32_le(),
            num_hosts: b.get_u64_le(),
            max_hosts: b.get_u64_le(),
            owner_id: b.get_u64_le(),
            owner_generation: b.get_u64_le(),
            lver: b.get_u64_le(),
            ..Default::default()
        };
        b.copy_to_slice(&mut lr.space_name);
        b.copy_to_slice(&mut lr.resource_name);
        lr.timestamp = b.get_u64_le();
        lr.io_timeout = b.get_u32_le();
        b.advance(4);
        lr.checksum = b.get_u32_le();
        b.advance(4);
        lr.write_id = b.get_u64_le();
        lr.write_generation = b.get_u64_le();
        lr.write_timestamp = b.get_u64_le();
        Ok((lr, computed))
    }

    pub fn verify_checksum(&self, computed: u32) -> Result<()> {
        if self.checksum != computed {
            return Err(Error::LeaderChecksum {
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    pub fn is_free(&self) -> bool {
        self.timestamp == LEASE_FREE
    }

    pub fn has_short_hold(&self) -> bool {
        self.flags & LEADER_FLAG_SHORT_HOLD != 0
    }

    pub fn space_name_str(&self) -> String {
        crate::name_str(&self.space_name)
    }

    pub fn resource_name_str(&self) -> String {
        crate::name_str(&self.resource_name)
    }

    /// Equality that ignores who physically wrote the record last, used to
    /// detect "the lease changed while we waited".
    pub fn same_lease_state(&self, other: &LeaderRecord) -> bool {
        self.lver == other.lver
            && self.owner_id == other.owner_id
            && self.owner_generation == other.owner_generation
            && self.timestamp == other.timestamp
            && self.space_name == other.space_name
            && self.resource_name == other.resource_name
    }
}
