//! The daemon value: configuration, timeouts and the live registries,
//! passed by reference everywhere instead of living in globals.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use delta_lease::Timeouts;
use sector_io::SyncDisk;
use wdmd_client::{NullWatchdog, WatchdogLink, WdmdClient};

use crate::client::{kill_pid, pid_alive, ClientTable};
use crate::config::cli;
use crate::config::trace::LogRing;
use crate::errors::{Error, Result};
use crate::lockspaces::LockspaceRegistry;
use crate::protocol::{ClientStatus, LockspaceStatus, StatusReply, TokenStatus};
use crate::tokens::{TokenManager, TokenState};

#[derive(Debug)]
pub struct Daemon {
    pub config: cli::Config,
    pub timeouts: Timeouts,
    pub lockspaces: LockspaceRegistry,
    pub clients: ClientTable,
    pub tokens: TokenManager,
    pub log_ring: LogRing,
    pub cancel: CancellationToken,
}

impl Daemon {
    pub fn new(config: cli::Config, log_ring: LogRing) -> Arc<Daemon> {
        let timeouts = config.timeouts();
        Arc::new(Daemon {
            config,
            timeouts,
            lockspaces: LockspaceRegistry::new(),
            clients: ClientTable::default(),
            tokens: TokenManager::default(),
            log_ring,
            cancel: CancellationToken::new(),
        })
    }

    /// Open a lease disk the way this daemon is configured to.
    pub fn open_disk(&self, path: &str, offset: u64) -> Result<SyncDisk> {
        let disk = if self.config.direct_io {
            SyncDisk::open_direct(path, offset)?
        } else {
            SyncDisk::open_buffered(path, offset)?
        };
        Ok(disk)
    }

    /// The watchdog connection a lockspace renewal worker arms. Names are
    /// wire-compatible with the multiplexer convention.
    pub async fn watchdog_for(&self, space: &str, host_id: u64) -> Result<Arc<dyn WatchdogLink>> {
        if !self.config.use_watchdog {
            return Ok(Arc::new(NullWatchdog));
        }
        let name = format!("sanlock_{space}_hostid{host_id}");
        let client = WdmdClient::connect(&self.config.wdmd_socket, &name).await?;
        Ok(Arc::new(client))
    }

    /// Daemon-wide watchdog setup: hold a refcount on the multiplexer for
    /// our lifetime and refuse to run if the fencing arithmetic is off.
    /// Returns `None` when the watchdog is disabled by configuration.
    pub async fn setup_watchdog(&self) -> Result<Option<WdmdClient>> {
        if !self.config.use_watchdog {
            warn!("watchdog disabled: renewal failures will not fence this host");
            return Ok(None);
        }
        let conn = WdmdClient::connect(&self.config.wdmd_socket, "moor_daemon").await?;
        conn.refcount_set().await?;
        let status = conn.status().await?;

        let renewal_fail = self.timeouts.host_id_renewal_fail_seconds();
        let host_id_timeout = self.timeouts.host_id_timeout_seconds();
        let fire_timeout = u64::from(status.fire_timeout);
        if renewal_fail + fire_timeout != host_id_timeout {
            conn.refcount_clear().await.ok();
            return Err(Error::FencingConfig {
                renewal_fail,
                fire_timeout,
                host_id_timeout,
            });
        }
        info!(
            test_interval = status.test_interval,
            fire_timeout = status.fire_timeout,
            last_keepalive = status.last_keepalive,
            "watchdog multiplexer verified"
        );
        Ok(Some(conn))
    }

    pub fn status(&self) -> StatusReply {
        let lockspaces = self
            .lockspaces
            .snapshot()
            .into_iter()
            .map(|ls| LockspaceStatus {
                name: ls.name().to_string(),
                host_id: ls.host_id(),
                generation: ls.generation(),
                renewal_current: ls.renewal_current(),
            })
            .collect();
        let clients = self
            .clients
            .snapshot()
            .into_iter()
            .map(|c| ClientStatus {
                id: c.id,
                pid: c.pid,
                tokens: self.tokens.by_client(c.id).len(),
            })
            .collect();
        let tokens = self
            .tokens
            .snapshot()
            .into_iter()
            .map(|e| TokenStatus {
                id: e.id,
                pid: e.pid,
                lockspace: e.token.space_name.clone(),
                resource: e.token.resource_name.clone(),
                state: e.state.as_str().to_string(),
                lver: e.leader.map(|l| l.lver).unwrap_or(0),
            })
            .collect();
        StatusReply {
            lockspaces,
            clients,
            tokens,
        }
    }

    /// Orderly teardown: stop supervised pids, give back every held
    /// lease, then leave the lockspaces (which disarms the watchdog).
    pub async fn shutdown(&self) {
        info!("daemon shutting down");
        self.cancel.cancel();

        let pids = self.clients.pids();
        for pid in &pids {
            kill_pid(*pid, libc::SIGTERM);
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.kill_grace);
        while pids.iter().any(|pid| pid_alive(*pid)) {
            if tokio::time::Instant::now() >= deadline {
                for pid in &pids {
                    if pid_alive(*pid) {
                        warn!(pid, "pid survived SIGTERM, sending SIGKILL");
                        kill_pid(*pid, libc::SIGKILL);
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for entry in self.tokens.snapshot() {
            if matches!(
                entry.state,
                TokenState::Held | TokenState::SavedForReacquire
            ) {
                if let Err(err) = crate::ops::release_token_entry(self, &entry, None).await {
                    warn!(resource = %entry.token.resource_name, %err, "release at shutdown failed");
                }
            }
        }

        self.lockspaces.stop_all().await;
        info!("daemon stopped");
    }
}
