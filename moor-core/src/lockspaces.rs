//! The lockspace registry: every joined lockspace with its workers, and
//! the liveness view the paxos engine consults.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::{info, warn};

use delta_lease::{lease, DeltaDisk, HostStatus, Lockspace, Timeouts};
use paxos_lease::HostLiveness;
use sector_io::SyncDisk;
use wdmd_client::WatchdogLink;

use crate::errors::{Error, Result};

#[derive(Debug, Default)]
pub struct LockspaceRegistry {
    inner: RwLock<HashMap<String, Arc<Lockspace>>>,
    /// Names with a join in flight, so two clients cannot race one name.
    joining: Mutex<HashSet<String>>,
}

impl LockspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a lockspace: acquire the host_id on `disk` and start its
    /// workers. This blocks for the delta-lease acquire waits.
    pub async fn add(
        &self,
        name: &str,
        host_id: u64,
        disk: SyncDisk,
        max_hosts: u64,
        timeouts: Timeouts,
        watchdog: Arc<dyn WatchdogLink>,
    ) -> Result<Arc<Lockspace>> {
        {
            if self.inner.read().unwrap().contains_key(name) {
                return Err(Error::LockspaceExists(name.to_string()));
            }
            let mut joining = self.joining.lock().unwrap();
            if !joining.insert(name.to_string()) {
                return Err(Error::LockspaceExists(name.to_string()));
            }
        }

        let sector_size = disk.sector_size();
        let dd = DeltaDisk::new(disk, sector_size, name);
        let result = Lockspace::start(dd, host_id, max_hosts, timeouts, watchdog).await;
        self.joining.lock().unwrap().remove(name);

        match result {
            Ok(ls) => {
                self.inner
                    .write()
                    .unwrap()
                    .insert(name.to_string(), Arc::clone(&ls));
                Ok(ls)
            }
            Err(err) => {
                warn!(space = name, %err, "lockspace join failed");
                Err(err.into())
            }
        }
    }

    /// Leave a lockspace: stop workers, free the delta lease, disarm.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let ls = self
            .inner
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| Error::UnknownLockspace(name.to_string()))?;
        ls.stop().await?;
        info!(space = name, "lockspace removed");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Lockspace>> {
        self.inner.read().unwrap().get(name).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Lockspace>> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    /// Stop everything; join order does not matter.
    pub async fn stop_all(&self) {
        let all: Vec<(String, Arc<Lockspace>)> = {
            let mut inner = self.inner.write().unwrap();
            inner.drain().collect()
        };
        for (name, ls) in all {
            if let Err(err) = ls.stop().await {
                warn!(space = %name, %err, "lockspace stop failed");
            }
        }
    }

    /// Initialize a lockspace area without joining it (the init-lockspace
    /// tool path).
    pub async fn init_area(
        disk: SyncDisk,
        name: &str,
        max_hosts: u64,
        timeouts: &Timeouts,
    ) -> Result<()> {
        let sector_size = disk.sector_size();
        let dd = DeltaDisk::new(disk, sector_size, name);
        lease::init(&dd, timeouts, max_hosts).await?;
        Ok(())
    }
}

#[async_trait]
impl HostLiveness for LockspaceRegistry {
    async fn host_info(&self, space_name: &str, host_id: u64) -> Option<HostStatus> {
        self.get(space_name)?.host_info(host_id)
    }

    async fn lockspace_disk(&self, space_name: &str) -> Option<DeltaDisk> {
        Some(self.get(space_name)?.delta_disk().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wdmd_client::NullWatchdog;

    fn scratch_disk() -> (tempfile::NamedTempFile, SyncDisk) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(ondisk::ALIGN_SIZE_1M).unwrap();
        let disk = SyncDisk::open_buffered(file.path(), 0).unwrap();
        (file, disk)
    }

    fn test_timeouts() -> Timeouts {
        Timeouts::new(2).with_host_dead_override(0)
    }

    #[tokio::test]
    async fn test_join_twice_rejected() {
        let (_file, disk) = scratch_disk();
        LockspaceRegistry::init_area(disk.clone(), "vg01", 16, &test_timeouts())
            .await
            .unwrap();

        let registry = LockspaceRegistry::new();
        registry
            .add("vg01", 1, disk.clone(), 16, test_timeouts(), Arc::new(NullWatchdog))
            .await
            .unwrap();
        let err = registry
            .add("vg01", 2, disk, 16, test_timeouts(), Arc::new(NullWatchdog))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockspaceExists(_)));

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_liveness_view() {
        let (_file, disk) = scratch_disk();
        LockspaceRegistry::init_area(disk.clone(), "vg01", 16, &test_timeouts())
            .await
            .unwrap();

        let registry = LockspaceRegistry::new();
        registry
            .add("vg01", 3, disk, 16, test_timeouts(), Arc::new(NullWatchdog))
            .await
            .unwrap();

        assert!(registry.lockspace_disk("vg01").await.is_some());
        assert!(registry.lockspace_disk("vg02").await.is_none());
        assert!(registry.host_info("vg02", 3).await.is_none());

        registry.remove("vg01").await.unwrap();
        assert!(registry.get("vg01").is_none());
    }
}
