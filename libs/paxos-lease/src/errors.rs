//! Error kinds of the paxos engine. Each kind has a stable negative wire
//! code that the daemon returns in a reply's data field.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] sector_io::Error),
    #[error(transparent)]
    Codec(#[from] ondisk::Error),
    #[error(transparent)]
    Delta(#[from] delta_lease::Error),

    #[error("leader has wrong magic {magic:#010x}")]
    LeaderMagic { magic: u32 },
    #[error("leader has wrong version {version:#010x}")]
    LeaderVersion { version: u32 },
    #[error("leader belongs to lockspace {found:?}, expected {expected:?}")]
    LeaderLockspace { found: String, expected: String },
    #[error("leader names resource {found:?}, expected {expected:?}")]
    LeaderResource { found: String, expected: String },
    #[error("leader num_hosts {num_hosts} below our host_id {host_id}")]
    LeaderNumHosts { num_hosts: u64, host_id: u64 },
    #[error("leader read failed on a majority of disks")]
    LeaderRead,
    #[error("leader write failed on a majority of disks")]
    LeaderWrite,
    #[error("leader differs across a majority of disks")]
    LeaderDiff,

    #[error("dblock read failed on a majority of disks")]
    DblockRead,
    #[error("dblock write failed on a majority of disks")]
    DblockWrite,
    #[error("ballot aborted: host {host_id} holds larger mbal {seen}")]
    DblockMbal { host_id: u64, seen: u64 },
    #[error("ballot aborted: host {host_id} holds larger lver {seen}")]
    DblockLver { host_id: u64, seen: u64 },
    #[error("ballot retries exhausted")]
    BallotRetries,

    #[error("leader lver {found} does not match requested {wanted}")]
    AcquireLver { wanted: u64, found: u64 },
    #[error("no lockspace information for {0:?}")]
    AcquireLockspace(String),
    #[error("owner {owner_id}:{owner_generation} is alive")]
    AcquireIdLive {
        owner_id: u64,
        owner_generation: u64,
    },
    #[error("lease owned by {owner_id}:{owner_generation}")]
    AcquireOwned {
        owner_id: u64,
        owner_generation: u64,
    },
    #[error("owner alive and caller asked not to wait")]
    AcquireOwnedRetry,
    #[error("ballot committed other owner {owner_id}:{owner_generation}")]
    AcquireOther {
        owner_id: u64,
        owner_generation: u64,
    },
    #[error("host {host_id} holds a live shared claim")]
    AcquireSharedHeld { host_id: u64 },

    #[error("release found leader at lver {found}, expected {expected}")]
    ReleaseLver { expected: u64, found: u64 },
    #[error("release found owner {owner_id}:{owner_generation} ts {timestamp}")]
    ReleaseOwner {
        owner_id: u64,
        owner_generation: u64,
        timestamp: u64,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Negated kind for the client reply's data field.
    pub fn wire_code(&self) -> i32 {
        match self {
            Error::Io(e) if e.is_timeout() => -201,
            Error::Io(_) => -202,
            Error::Codec(ondisk::Error::LeaderChecksum { .. }) => -218,
            Error::Codec(ondisk::Error::DblockChecksum { .. }) => -222,
            Error::Codec(_) => -203,
            Error::Delta(_) => -242,
            Error::LeaderRead => -210,
            Error::LeaderWrite => -211,
            Error::LeaderDiff => -212,
            Error::LeaderMagic { .. } => -213,
            Error::LeaderVersion { .. } => -214,
            Error::LeaderLockspace { .. } => -215,
            Error::LeaderResource { .. } => -216,
            Error::LeaderNumHosts { .. } => -217,
            Error::DblockRead => -220,
            Error::DblockWrite => -221,
            Error::DblockMbal { .. } => -223,
            Error::DblockLver { .. } => -224,
            Error::BallotRetries => -225,
            Error::AcquireLver { .. } => -240,
            Error::AcquireLockspace(_) => -241,
            Error::AcquireIdLive { .. } => -243,
            Error::AcquireOwned { .. } => -244,
            Error::AcquireOwnedRetry => -245,
            Error::AcquireOther { .. } => -246,
            Error::AcquireSharedHeld { .. } => -247,
            Error::ReleaseLver { .. } => -250,
            Error::ReleaseOwner { .. } => -251,
            Error::Cancelled => -1,
        }
    }

    /// Ballot aborts that the engine retries with a raised mbal.
    pub fn is_ballot_retry(&self) -> bool {
        matches!(self, Error::DblockMbal { .. } | Error::DblockLver { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
