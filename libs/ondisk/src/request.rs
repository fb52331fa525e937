//! The advisory request record in sector 1 of a resource area.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

pub const REQUEST_MAGIC: u32 = 0x0829_2011;
pub const REQUEST_VERSION_MAJOR: u32 = 0x0001_0000;
pub const REQUEST_VERSION: u32 = 0x0001_0001;
pub const REQUEST_ENCODED_LEN: usize = 20;

/// How a requester wants the current owner to yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceMode {
    #[default]
    None,
    /// Kill the owning process so the daemon releases its leases.
    KillPid,
    /// Ask the owner to release voluntarily.
    Graceful,
}

impl ForceMode {
    pub fn as_u32(self) -> u32 {
        match self {
            ForceMode::None => 0,
            ForceMode::KillPid => 1,
            ForceMode::Graceful => 2,
        }
    }

    pub fn from_u32(v: u32) -> Option<ForceMode> {
        match v {
            0 => Some(ForceMode::None),
            1 => Some(ForceMode::KillPid),
            2 => Some(ForceMode::Graceful),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestRecord {
    pub magic: u32,
    pub version: u32,
    /// Version of the lease the requester wants to disturb.
    pub lver: u64,
    pub force_mode: u32,
}

impl RequestRecord {
    pub fn new(lver: u64, force_mode: ForceMode) -> Self {
        RequestRecord {
            magic: REQUEST_MAGIC,
            version: REQUEST_VERSION,
            lver,
            force_mode: force_mode.as_u32(),
        }
    }

    pub fn encode_into(&self, sector: &mut [u8]) -> Result<()> {
        if sector.len() < REQUEST_ENCODED_LEN {
            return Err(Error::Truncated {
                need: REQUEST_ENCODED_LEN,
                got: sector.len(),
            });
        }
        let mut b = &mut sector[..REQUEST_ENCODED_LEN];
        b.put_u32_le(self.magic);
        b.put_u32_le(self.version);
        b.put_u64_le(self.lver);
        b.put_u32_le(self.force_mode);
        Ok(())
    }

    pub fn decode_from(sector: &[u8]) -> Result<RequestRecord> {
        if sector.len() < REQUEST_ENCODED_LEN {
            return Err(Error::Truncated {
                need: REQUEST_ENCODED_LEN,
                got: sector.len(),
            });
        }
        let mut b = &sector[..REQUEST_ENCODED_LEN];
        Ok(RequestRecord {
            magic: b.get_u32_le(),
            version: b.get_u32_le(),
            lver: b.get_u64_le(),
            force_mode: b.get_u32_le(),
        })
    }

    pub fn force_mode(&self) -> Option<ForceMode> {
        ForceMode::from_u32(self.force_mode)
    }
}
