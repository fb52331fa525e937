//! Background polling of request records for held resources, plus expiry
//! of the saved-for-reacquire bucket.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use ondisk::request::REQUEST_MAGIC;
use ondisk::{ForceMode, RequestRecord};

use crate::client::kill_pid;
use crate::daemon::Daemon;
use crate::ops::release_token_entry;
use crate::tokens::TokenEntry;

/// Run one poller for the daemon's lifetime. Owners that are alive and
/// polling are exactly the ones a request record can reach; a dead owner
/// ignores it and the requester's ballot takes over.
pub fn spawn_request_poller(daemon: Arc<Daemon>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(daemon.timeouts.host_id_renewal_seconds().max(1));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = daemon.cancel.cancelled() => {
                    debug!("request poller stopping");
                    return;
                }
                _ = ticker.tick() => {
                    expire_saved(&daemon).await;
                    poll_requests(&daemon).await;
                }
            }
        }
    })
}

async fn expire_saved(daemon: &Daemon) {
    for entry in daemon.tokens.expired_saved() {
        info!(
            resource = %entry.token.resource_name,
            "saved lease expired without reacquire, releasing"
        );
        if let Err(err) = release_token_entry(daemon, &entry, None).await {
            warn!(resource = %entry.token.resource_name, %err, "saved lease release failed");
        }
    }
}

async fn poll_requests(daemon: &Daemon) {
    for entry in daemon.tokens.held() {
        if entry.migrating {
            continue;
        }
        let Some(leader) = entry.leader else { continue };
        let rr = match paxos_lease::request_read(&entry.token).await {
            Ok(rr) => rr,
            Err(err) => {
                debug!(resource = %entry.token.resource_name, %err, "request record read failed");
                continue;
            }
        };
        if rr.magic != REQUEST_MAGIC || rr.lver != leader.lver {
            continue;
        }
        match rr.force_mode() {
            Some(ForceMode::Graceful) => {
                info!(
                    resource = %entry.token.resource_name,
                    lver = rr.lver,
                    "graceful release requested by a peer"
                );
                clear_request(&entry).await;
                if let Err(err) = release_token_entry(daemon, &entry, None).await {
                    warn!(resource = %entry.token.resource_name, %err, "requested release failed");
                }
            }
            Some(ForceMode::KillPid) => {
                warn!(
                    resource = %entry.token.resource_name,
                    pid = entry.pid,
                    lver = rr.lver,
                    "forced release requested, stopping holder"
                );
                clear_request(&entry).await;
                // pid death releases its leases through the client path
                kill_pid(entry.pid, libc::SIGTERM);
            }
            _ => {}
        }
    }
}

async fn clear_request(entry: &TokenEntry) {
    let cleared = RequestRecord::new(0, ForceMode::None);
    if let Err(err) = paxos_lease::request_write(&entry.token, &cleared).await {
        debug!(resource = %entry.token.resource_name, %err, "request record clear failed");
    }
}
