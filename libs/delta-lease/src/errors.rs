#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] sector_io::Error),
    #[error(transparent)]
    Codec(#[from] ondisk::Error),
    #[error("delta lease has wrong magic {magic:#010x}")]
    Magic { magic: u32 },
    #[error("delta lease has wrong version {version:#010x}")]
    Version { version: u32 },
    #[error("delta lease belongs to lockspace {found:?}, expected {expected:?}")]
    Lockspace { found: String, expected: String },
    #[error("delta lease sector names {found:?}, expected {expected:?}")]
    HostIdName { found: String, expected: String },
    #[error("host_id {host_id} held by {owner_id}:{owner_generation}")]
    Owned {
        host_id: u64,
        owner_id: u64,
        owner_generation: u64,
    },
    #[error("renewal found foreign state {owner_id}:{owner_generation} ts {timestamp}")]
    RenewalOwner {
        owner_id: u64,
        owner_generation: u64,
        timestamp: u64,
    },
    #[error(transparent)]
    Watchdog(#[from] wdmd_client::Error),
}

impl Error {
    /// Timed-out and checksum-failed i/o both count as renewal failures for
    /// the fencing deadline.
    pub fn is_io_timeout(&self) -> bool {
        matches!(self, Error::Io(e) if e.is_timeout())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
