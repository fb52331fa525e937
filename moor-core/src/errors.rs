//! Daemon-level errors. Engine errors pass through with their own wire
//! codes; the daemon adds the bookkeeping failures around them.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("client is busy with another command")]
    Busy,
    #[error("client is not registered")]
    NotRegistered,
    #[error("unknown lockspace {0:?}")]
    UnknownLockspace(String),
    #[error("lockspace {0:?} already joined")]
    LockspaceExists(String),
    #[error("lockspace {0:?} renewal is not current")]
    LockspaceStale(String),
    #[error("lockspace {0:?} has leases in use")]
    LockspaceBusy(String),
    #[error("pid {pid} holds the lease limit of {limit}")]
    TooManyLeases { pid: i32, limit: usize },
    #[error("pid {pid} already holds {resource:?}")]
    LeaseExists { pid: i32, resource: String },
    #[error("no lease {resource:?} for pid {pid}")]
    UnknownLease { pid: i32, resource: String },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(
        "fencing config invalid: renewal_fail {renewal_fail} + fire_timeout {fire_timeout} \
         != host_id_timeout {host_id_timeout}"
    )]
    FencingConfig {
        renewal_fail: u64,
        fire_timeout: u64,
        host_id_timeout: u64,
    },

    #[error(transparent)]
    Paxos(#[from] paxos_lease::Error),
    #[error(transparent)]
    Delta(#[from] delta_lease::Error),
    #[error(transparent)]
    Watchdog(#[from] wdmd_client::Error),
    #[error(transparent)]
    DiskIo(#[from] sector_io::Error),
}

impl Error {
    /// Negated kind carried in a reply header's data field.
    pub fn wire_code(&self) -> i32 {
        match self {
            Error::Busy => -101,
            Error::NotRegistered => -102,
            Error::UnknownLockspace(_) => -103,
            Error::LockspaceExists(_) => -104,
            Error::LockspaceStale(_) => -105,
            Error::LockspaceBusy(_) => -106,
            Error::TooManyLeases { .. } => -107,
            Error::LeaseExists { .. } => -108,
            Error::UnknownLease { .. } => -109,
            Error::BadRequest(_) => -110,
            Error::FencingConfig { .. } => -111,
            Error::Paxos(e) => e.wire_code(),
            Error::Delta(_) => -120,
            Error::Watchdog(_) => -121,
            Error::DiskIo(e) if e.is_timeout() => -201,
            Error::DiskIo(_) => -202,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
