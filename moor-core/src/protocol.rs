//! Client wire protocol: a fixed little-endian header followed by a JSON
//! payload. Non-zero `data` in a reply header carries the negated error
//! kind; `data2` is command-specific.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

pub const HEADER_MAGIC: u32 = 0x0428_2010;
pub const PROTO_VERSION_MAJOR: u32 = 0x0001_0000;
pub const PROTO_VERSION: u32 = 0x0001_0001;
pub const HEADER_LEN: usize = 32;
/// Upper bound on a payload; anything larger is a protocol error.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Register = 1,
    SetHostId = 2,
    RemLockspace = 3,
    Acquire = 4,
    Release = 5,
    Migrate = 6,
    SetOwner = 7,
    Request = 8,
    Status = 9,
    LogDump = 10,
    Shutdown = 11,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Command> {
        match v {
            1 => Some(Command::Register),
            2 => Some(Command::SetHostId),
            3 => Some(Command::RemLockspace),
            4 => Some(Command::Acquire),
            5 => Some(Command::Release),
            6 => Some(Command::Migrate),
            7 => Some(Command::SetOwner),
            8 => Some(Command::Request),
            9 => Some(Command::Status),
            10 => Some(Command::LogDump),
            11 => Some(Command::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub cmd: u32,
    pub seq: u32,
    pub length: u32,
    pub data: i32,
    pub data2: u32,
}

impl Header {
    pub fn request(cmd: Command, seq: u32, length: u32) -> Header {
        Header {
            magic: HEADER_MAGIC,
            version: PROTO_VERSION,
            cmd: cmd as u32,
            seq,
            length,
            data: 0,
            data2: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        {
            let mut b = &mut out[..];
            b.put_u32_le(self.magic);
            b.put_u32_le(self.version);
            b.put_u32_le(self.cmd);
            b.put_u32_le(self.seq);
            b.put_u32_le(self.length);
            b.put_i32_le(self.data);
            b.put_u32_le(self.data2);
            b.put_u32_le(0); // reserved
        }
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Header {
        let mut b = &raw[..];
        Header {
            magic: b.get_u32_le(),
            version: b.get_u32_le(),
            cmd: b.get_u32_le(),
            seq: b.get_u32_le(),
            length: b.get_u32_le(),
            data: b.get_i32_le(),
            data2: b.get_u32_le(),
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_u32(self.cmd)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.magic != HEADER_MAGIC {
            return Err(format!("bad magic {:#x}", self.magic));
        }
        if self.version & 0xffff_0000 != PROTO_VERSION_MAJOR {
            return Err(format!("bad version {:#x}", self.version));
        }
        if self.length > MAX_PAYLOAD_LEN {
            return Err(format!("payload too large: {}", self.length));
        }
        Ok(())
    }
}

/// Join a lockspace as `host_id` (the SET_HOST_ID command).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockspaceSpec {
    pub name: String,
    pub host_id: u64,
    pub path: String,
    pub offset: u64,
    /// Override the daemon's i/o timeout for this lockspace.
    pub io_timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSpec {
    pub lockspace: String,
    pub name: String,
    pub path: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub resources: Vec<ResourceSpec>,
    pub shared: bool,
    /// Require this exact lease version (0 = any).
    pub acquire_lver: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    /// Resource names to drop; ignored when `all` is set.
    pub resources: Vec<String>,
    pub all: bool,
    /// Write this resource name into the leader with the FREE transition.
    pub rename: Option<RenameSpec>,
    /// Keep the disk lease held briefly so a successor pid of the same
    /// owner can reacquire without a ballot.
    pub save_for_reacquire: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenameSpec {
    pub resource: String,
    pub new_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateRequest {
    pub resource: String,
}

/// What the destination daemon needs for SETOWNER.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateReply {
    pub resource: String,
    pub lver: u64,
    pub owner_generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetOwnerRequest {
    pub resources: Vec<ResourceSpec>,
    /// The pre-migration owner whose leases we are inheriting.
    pub source_host_id: u64,
    pub source_generation: u64,
}

/// Write a resource's request record (the advisory nudge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceRequest {
    pub resource: ResourceSpec,
    /// Lease version to disturb (0 = whatever the leader holds now).
    pub lver: u64,
    pub force_mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusReply {
    pub lockspaces: Vec<LockspaceStatus>,
    pub clients: Vec<ClientStatus>,
    pub tokens: Vec<TokenStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockspaceStatus {
    pub name: String,
    pub host_id: u64,
    pub generation: u64,
    pub renewal_current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatus {
    pub id: u64,
    pub pid: Option<i32>,
    pub tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStatus {
    pub id: u64,
    pub pid: i32,
    pub lockspace: String,
    pub resource: String,
    pub state: String,
    pub lver: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDumpReply {
    pub lines: Vec<String>,
}
