//! Shared fixtures for the paxos engine tests: file-backed lease areas and
//! a scriptable liveness source.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use delta_lease::{lease as delta, DeltaDisk, HostStatus, Timeouts};
use sector_io::SyncDisk;

use crate::token::Token;
use crate::HostLiveness;

pub(crate) const SPACE: &str = "vg01";
pub(crate) const RESOURCE: &str = "lv-root";

pub(crate) fn test_timeouts() -> Timeouts {
    Timeouts::new(10).with_host_dead_override(0)
}

/// A 512-byte-sector resource area on a temp file.
pub(crate) async fn scratch_resource(num_hosts: u64) -> (tempfile::NamedTempFile, Token) {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(ondisk::ALIGN_SIZE_1M).unwrap();
    let token = host_token(&file, 1, 1);
    crate::init::init(&token, num_hosts, false).await.unwrap();
    (file, token)
}

/// A token for `(host_id, generation)` against the same backing file.
pub(crate) fn host_token(file: &tempfile::NamedTempFile, host_id: u64, generation: u64) -> Token {
    let disk = SyncDisk::open_buffered(file.path(), 0).unwrap();
    Token::new(
        SPACE,
        RESOURCE,
        vec![disk],
        512,
        host_id,
        generation,
        test_timeouts(),
    )
    .unwrap()
}

/// A lockspace delta area on its own temp file, initialized for 16 hosts.
pub(crate) async fn scratch_lockspace() -> (tempfile::NamedTempFile, DeltaDisk) {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(ondisk::ALIGN_SIZE_1M).unwrap();
    let disk = SyncDisk::open_buffered(file.path(), 0).unwrap();
    let dd = DeltaDisk::new(disk, 512, SPACE);
    delta::init(&dd, &test_timeouts(), 16).await.unwrap();
    (file, dd)
}

/// Scriptable [`HostLiveness`]: tests decide what the monitor saw.
pub(crate) struct FakeLiveness {
    pub dd: Option<DeltaDisk>,
    pub hosts: Mutex<HashMap<u64, HostStatus>>,
}

impl FakeLiveness {
    pub fn new(dd: Option<DeltaDisk>) -> Self {
        FakeLiveness {
            dd,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_host(&self, host_id: u64, hs: HostStatus) {
        self.hosts.lock().unwrap().insert(host_id, hs);
    }
}

#[async_trait]
impl HostLiveness for FakeLiveness {
    async fn host_info(&self, _space_name: &str, host_id: u64) -> Option<HostStatus> {
        self.hosts.lock().unwrap().get(&host_id).copied()
    }

    async fn lockspace_disk(&self, _space_name: &str) -> Option<DeltaDisk> {
        self.dd.clone()
    }
}
