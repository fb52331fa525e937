//! # ondisk
//!
//! Canonical little-endian layouts for everything the lease manager writes
//! to a shared disk: the leader record (also the delta-lease record), the
//! per-host paxos dblock with its colocated mode block, and the request
//! record. Every field crosses this codec; nothing above it touches raw
//! bytes or relies on host struct layout.

pub mod checksum;
pub mod dblock;
pub mod leader;
pub mod request;

pub use checksum::wire_checksum;
pub use dblock::{Dblock, ModeBlock};
pub use leader::LeaderRecord;
pub use request::{ForceMode, RequestRecord};

/// Lockspace and resource names on disk, NUL padded.
pub const NAME_SIZE: usize = 48;

pub const SECTOR_SIZE_512: u32 = 512;
pub const SECTOR_SIZE_4K: u32 = 4096;
pub const ALIGN_SIZE_1M: u64 = 1024 * 1024;
pub const ALIGN_SIZE_8M: u64 = 8 * 1024 * 1024;
pub const DEFAULT_MAX_HOSTS: u64 = 2000;

/// Sector roles within a resource lease area.
pub const LEADER_SECTOR: u64 = 0;
pub const REQUEST_SECTOR: u64 = 1;
pub const DBLOCK_SECTOR_BASE: u64 = 2;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("leader checksum mismatch: stored {stored:#010x} computed {computed:#010x}")]
    LeaderChecksum { stored: u32, computed: u32 },
    #[error("dblock checksum mismatch: stored {stored:#010x} computed {computed:#010x}")]
    DblockChecksum { stored: u32, computed: u32 },
    #[error("record truncated: need {need} bytes, buffer holds {got}")]
    Truncated { need: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lease-area size for a sector size, or `None` if unsupported.
pub fn align_size_for_sector(sector_size: u32) -> Option<u64> {
    match sector_size {
        SECTOR_SIZE_512 => Some(ALIGN_SIZE_1M),
        SECTOR_SIZE_4K => Some(ALIGN_SIZE_8M),
        _ => None,
    }
}

/// Sector of `host_id`'s dblock within a resource area.
pub fn dblock_sector(host_id: u64) -> u64 {
    DBLOCK_SECTOR_BASE + host_id - 1
}

/// Sector of `host_id`'s delta lease within a lockspace area.
pub fn delta_sector(host_id: u64) -> u64 {
    host_id - 1
}

/// Fixed-size on-disk name from a string; over-long input is truncated.
pub fn name_bytes(s: &str) -> [u8; NAME_SIZE] {
    let mut out = [0u8; NAME_SIZE];
    let n = s.len().min(NAME_SIZE);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

/// Printable form of an on-disk name (up to the first NUL).
pub fn name_str(name: &[u8; NAME_SIZE]) -> String {
    let end = name.iter().position(|b| *b == 0).unwrap_or(NAME_SIZE);
    String::from_utf8_lossy(&name[..end]).into_owned()
}

/// Canonical resource name of a delta-lease sector.
pub fn host_id_name(host_id: u64) -> [u8; NAME_SIZE] {
    name_bytes(&format!("hostid {host_id}"))
}
