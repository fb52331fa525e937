//! Per-host Disk-Paxos scratch blocks and the colocated mode block.

use bytes::{Buf, BufMut};

use crate::checksum::wire_checksum;
use crate::{Error, Result};

/// Bytes covered by the dblock checksum.
pub const DBLOCK_CHECKSUM_LEN: usize = 48;
/// Encoded dblock length on disk.
pub const DBLOCK_ENCODED_LEN: usize = 56;
/// The holder released the lease even though another host wrote the leader.
pub const DBLOCK_FLAG_RELEASED: u32 = 0x0000_0001;

/// Byte offset of the mode block within a host's dblock sector.
pub const MODE_BLOCK_OFFSET: usize = 128;
pub const MODE_BLOCK_ENCODED_LEN: usize = 12;
/// The host holds (or claims) this resource in shared mode.
pub const MODE_BLOCK_SHARED: u32 = 0x0000_0001;

/// One host's ballot scratch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dblock {
    /// Ballot number this host will not go below.
    pub mbal: u64,
    /// Ballot at which `inp` was written.
    pub bal: u64,
    /// Proposed owner host_id.
    pub inp: u64,
    /// Proposed owner generation.
    pub inp2: u64,
    /// Proposed owner timestamp.
    pub inp3: u64,
    pub lver: u64,
    pub checksum: u32,
    pub flags: u32,
}

impl Dblock {
    pub fn encode_into(&mut self, sector: &mut [u8]) -> Result<u32> {
        if sector.len() < DBLOCK_ENCODED_LEN {
            return Err(Error::Truncated {
                need: DBLOCK_ENCODED_LEN,
                got: sector.len(),
            });
        }
        {
            let mut b = &mut sector[..DBLOCK_ENCODED_LEN];
            b.put_u64_le(self.mbal);
            b.put_u64_le(self.bal);
            b.put_u64_le(self.inp);
            b.put_u64_le(self.inp2);
            b.put_u64_le(self.inp3);
            b.put_u64_le(self.lver);
            b.put_u32_le(0); // checksum, stamped below
            b.put_u32_le(self.flags);
        }
        let checksum = wire_checksum(&sector[..DBLOCK_CHECKSUM_LEN]);
        sector[DBLOCK_CHECKSUM_LEN..DBLOCK_CHECKSUM_LEN + 4]
            .copy_from_slice(&checksum.to_le_bytes());
        self.checksum = checksum;
        Ok(checksum)
    }

    pub fn decode_from(sector: &[u8]) -> Result<(Dblock, u32)> {
        if sector.len() < DBLOCK_ENCODED_LEN {
            return Err(Error::Truncated {
                need: DBLOCK_ENCODED_LEN,
                got: sector.len(),
            });
        }
        let computed = wire_checksum(&sector[..DBLOCK_CHECKSUM_LEN]);
        let mut b = &sector[..DBLOCK_ENCODED_LEN];
        let db = Dblock {
            mbal: b.get_u64_le(),
            bal: b.get_u64_le(),
            inp: b.get_u64_le(),
            inp2: b.get_u64_le(),
            inp3: b.get_u64_le(),
            lver: b.get_u64_le(),
            checksum: b.get_u32_le(),
            flags: b.get_u32_le(),
        };
        Ok((db, computed))
    }

    /// A never-written (or erased) dblock decodes as all zero and is exempt
    /// from the checksum comparison.
    pub fn verify_checksum(&self, computed: u32) -> Result<()> {
        if self.checksum == 0
            && self.mbal == 0
            && self.bal == 0
            && self.inp == 0
            && self.lver == 0
        {
            return Ok(());
        }
        if self.checksum != computed {
            return Err(Error::DblockChecksum {
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.flags & DBLOCK_FLAG_RELEASED != 0
    }
}

/// Shared-mode claim colocated with the dblock. Not checksummed; readers
/// treat a zero block as "no claim".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeBlock {
    pub flags: u32,
    pub generation: u64,
}

impl ModeBlock {
    /// Encode at [`MODE_BLOCK_OFFSET`] within a dblock sector.
    pub fn encode_into(&self, sector: &mut [u8]) -> Result<()> {
        let end = MODE_BLOCK_OFFSET + MODE_BLOCK_ENCODED_LEN;
        if sector.len() < end {
            return Err(Error::Truncated {
                need: end,
                got: sector.len(),
            });
        }
        let mut b = &mut sector[MODE_BLOCK_OFFSET..end];
        b.put_u32_le(self.flags);
        b.put_u64_le(self.generation);
        Ok(())
    }

    /// Decode from [`MODE_BLOCK_OFFSET`] within a dblock sector.
    pub fn decode_from(sector: &[u8]) -> Result<ModeBlock> {
        let end = MODE_BLOCK_OFFSET + MODE_BLOCK_ENCODED_LEN;
        if sector.len() < end {
            return Err(Error::Truncated {
                need: end,
                got: sector.len(),
            });
        }
        let mut b = &sector[MODE_BLOCK_OFFSET..end];
        Ok(ModeBlock {
            flags: b.get_u32_le(),
            generation: b.get_u64_le(),
        })
    }

    pub fn is_shared(&self) -> bool {
        self.flags & MODE_BLOCK_SHARED != 0
    }
}
