//! Per-lockspace runtime: the renewal worker that keeps our delta lease
//! (and the watchdog pet) alive, and the monitor that observes peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ondisk::LeaderRecord;
use wdmd_client::WatchdogLink;

use crate::clock::monotime;
use crate::errors::Result;
use crate::lease::{self, DeltaDisk};
use crate::status::HostStatus;
use crate::timeouts::Timeouts;

/// A live lockspace membership: our acquired host_id plus the workers that
/// keep it alive and watch everyone else's.
pub struct Lockspace {
    name: String,
    host_id: u64,
    generation: u64,
    dd: DeltaDisk,
    max_hosts: u64,
    timeouts: Timeouts,
    watchdog: Arc<dyn WatchdogLink>,
    hosts: RwLock<HashMap<u64, HostStatus>>,
    record: Mutex<LeaderRecord>,
    last_success: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Lockspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lockspace")
            .field("name", &self.name)
            .field("host_id", &self.host_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Lockspace {
    /// Acquire `host_id`, arm the watchdog, then start the renewal and
    /// host-status workers. The lockspace is live once this returns; the
    /// watchdog is armed before that point, never after.
    pub async fn start(
        dd: DeltaDisk,
        host_id: u64,
        max_hosts: u64,
        timeouts: Timeouts,
        watchdog: Arc<dyn WatchdogLink>,
    ) -> Result<Arc<Lockspace>> {
        let record = lease::acquire(&dd, &timeouts, host_id).await?;
        let now = monotime();
        watchdog
            .arm(now, now + timeouts.host_id_renewal_fail_seconds())
            .await?;

        let ls = Arc::new(Lockspace {
            name: dd.space_name.clone(),
            host_id,
            generation: record.owner_generation,
            dd,
            max_hosts,
            timeouts,
            watchdog,
            hosts: RwLock::new(HashMap::new()),
            record: Mutex::new(record),
            last_success: AtomicU64::new(now),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let workers = vec![
            tokio::spawn(renewal_loop(Arc::clone(&ls))),
            tokio::spawn(status_loop(Arc::clone(&ls))),
        ];
        *ls.tasks.lock().unwrap() = workers;

        info!(
            space = %ls.name,
            host_id,
            generation = ls.generation,
            "lockspace live"
        );
        Ok(ls)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_id(&self) -> u64 {
        self.host_id
    }

    /// Generation acquired for this membership; bumped every time the
    /// host_id is (re)acquired.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn delta_disk(&self) -> &DeltaDisk {
        &self.dd
    }

    /// The monitor's latest view of a peer, if it has been seen at all.
    pub fn host_info(&self, host_id: u64) -> Option<HostStatus> {
        self.hosts.read().unwrap().get(&host_id).copied()
    }

    /// Whether our own renewal is inside the fencing window. Lease
    /// operations must refuse to start once this goes false.
    pub fn renewal_current(&self) -> bool {
        let silent = monotime().saturating_sub(self.last_success.load(Ordering::Relaxed));
        silent < self.timeouts.host_id_renewal_fail_seconds()
    }

    /// Stop the workers, free our delta lease, then disarm the watchdog.
    /// The disarm only happens after the FREE write has returned; a failed
    /// release leaves the watchdog armed on purpose.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.tasks.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }

        let prev = *self.record.lock().unwrap();
        lease::release(&self.dd, &self.timeouts, &prev).await?;
        self.watchdog.disarm().await?;
        info!(space = %self.name, host_id = self.host_id, "lockspace stopped");
        Ok(())
    }

    async fn renew_once(&self) {
        let prev = *self.record.lock().unwrap();
        match lease::renew(&self.dd, &self.timeouts, &prev).await {
            Ok(next) => {
                *self.record.lock().unwrap() = next;
                let now = monotime();
                self.last_success.store(now, Ordering::Relaxed);
                if let Err(err) = self
                    .watchdog
                    .arm(now, now + self.timeouts.host_id_renewal_fail_seconds())
                    .await
                {
                    error!(space = %self.name, %err, "watchdog arm failed after renewal");
                }
            }
            Err(err) => {
                let silent = monotime().saturating_sub(self.last_success.load(Ordering::Relaxed));
                if silent >= self.timeouts.host_id_renewal_fail_seconds() {
                    // past the deadline: stop arming and let the reset come
                    error!(
                        space = %self.name,
                        %err,
                        silent,
                        "renewal failed past the fencing deadline"
                    );
                } else {
                    warn!(space = %self.name, %err, silent, "host_id renewal failed, retrying");
                }
            }
        }
    }

    async fn scan_hosts(&self) {
        let list = match lease::read_hosts(&self.dd, &self.timeouts, self.max_hosts).await {
            Ok(list) => list,
            Err(err) => {
                warn!(space = %self.name, %err, "host status read failed");
                return;
            }
        };
        let now = monotime();
        let mut hosts = self.hosts.write().unwrap();
        for (idx, rec) in list.into_iter().enumerate() {
            let host_id = idx as u64 + 1;
            let Some(r) = rec else { continue };
            if r.owner_generation == 0 && r.timestamp == 0 {
                // never acquired
                continue;
            }
            let entry = hosts.entry(host_id).or_default();
            let changed = entry.last_check == 0
                || r.timestamp != entry.timestamp
                || r.owner_id != entry.owner_id
                || r.owner_generation != entry.owner_generation;
            if changed {
                entry.last_live = now;
            }
            entry.owner_id = r.owner_id;
            entry.owner_generation = r.owner_generation;
            entry.timestamp = r.timestamp;
            entry.io_timeout = r.io_timeout;
            entry.last_check = now;
        }
        debug!(space = %self.name, tracked = hosts.len(), "host status scan");
    }
}

async fn renewal_loop(ls: Arc<Lockspace>) {
    let period = Duration::from_secs(ls.timeouts.host_id_renewal_seconds());
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick; the acquire just renewed
    loop {
        tokio::select! {
            _ = ls.cancel.cancelled() => return,
            _ = ticker.tick() => ls.renew_once().await,
        }
    }
}

async fn status_loop(ls: Arc<Lockspace>) {
    let period = Duration::from_secs(ls.timeouts.host_id_renewal_seconds());
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ls.cancel.cancelled() => return,
            _ = ticker.tick() => ls.scan_hosts().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sector_io::SyncDisk;
    use wdmd_client::{WdmdStatus, WatchdogLink};

    /// Watchdog double that records every arm/disarm.
    #[derive(Debug, Default)]
    struct RecordingWatchdog {
        arms: Mutex<Vec<(u64, u64)>>,
        disarms: AtomicU64,
    }

    #[async_trait]
    impl WatchdogLink for RecordingWatchdog {
        async fn arm(&self, renew_ts: u64, expire_ts: u64) -> wdmd_client::Result<()> {
            self.arms.lock().unwrap().push((renew_ts, expire_ts));
            Ok(())
        }

        async fn disarm(&self) -> wdmd_client::Result<()> {
            self.disarms.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn status(&self) -> wdmd_client::Result<WdmdStatus> {
            Ok(WdmdStatus::default())
        }
    }

    async fn scratch_space() -> (tempfile::NamedTempFile, DeltaDisk) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(ondisk::ALIGN_SIZE_1M).unwrap();
        let disk = SyncDisk::open_buffered(file.path(), 0).unwrap();
        let dd = DeltaDisk::new(disk, 512, "vg01");
        lease::init(&dd, &Timeouts::default(), 16).await.unwrap();
        (file, dd)
    }

    #[tokio::test]
    async fn test_start_arms_before_live_and_stop_frees() {
        let (_file, dd) = scratch_space().await;
        let timeouts = Timeouts::new(2).with_host_dead_override(0);
        let watchdog = Arc::new(RecordingWatchdog::default());

        let ls = Lockspace::start(dd.clone(), 3, 16, timeouts, watchdog.clone())
            .await
            .unwrap();
        assert_eq!(ls.generation(), 1);
        assert!(ls.renewal_current());
        {
            let arms = watchdog.arms.lock().unwrap();
            assert!(!arms.is_empty());
            let (renew, expire) = arms[0];
            assert_eq!(expire - renew, timeouts.host_id_renewal_fail_seconds());
        }

        ls.stop().await.unwrap();
        assert_eq!(watchdog.disarms.load(Ordering::Relaxed), 1);
        let lr = lease::leader_read(&dd, &timeouts, 3).await.unwrap();
        assert!(lr.is_free());
        assert_eq!(lr.owner_generation, 1);
    }

    #[tokio::test]
    async fn test_monitor_tracks_peers() {
        let (_file, dd) = scratch_space().await;
        let timeouts = Timeouts::new(2).with_host_dead_override(0);
        let watchdog = Arc::new(RecordingWatchdog::default());

        // a peer occupies host_id 5 before we join
        let peer = lease::acquire(&dd, &timeouts, 5).await.unwrap();

        let ls = Lockspace::start(dd.clone(), 3, 16, timeouts, watchdog)
            .await
            .unwrap();

        // the monitor runs on the renewal cadence (1s at this io timeout)
        tokio::time::sleep(Duration::from_millis(1300)).await;

        let hs = ls.host_info(5).expect("peer observed");
        assert_eq!(hs.owner_id, 5);
        assert_eq!(hs.owner_generation, peer.owner_generation);
        assert!(hs.last_live > 0);
        assert!(ls.host_info(9).is_none());

        ls.stop().await.unwrap();
    }
}
