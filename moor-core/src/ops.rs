//! Command implementations. Each runs in the task of the connection that
//! asked for it, serialized by the client's command latch; the accept loop
//! never waits on a disk.

use std::sync::Arc;

use tracing::{info, warn};

use ondisk::{ForceMode, RequestRecord, DEFAULT_MAX_HOSTS};
use paxos_lease::{AcquireOptions, Token};

use crate::client::Client;
use crate::daemon::Daemon;
use crate::errors::{Error, Result};
use crate::protocol::{
    AcquireRequest, ForceRequest, LockspaceSpec, MigrateReply, MigrateRequest, ReleaseRequest,
    ResourceSpec, SetOwnerRequest,
};
use crate::tokens::{TokenEntry, TokenState};

/// SET_HOST_ID: join a lockspace. The delta-lease acquire waits happen
/// here, in this client's task.
pub async fn add_lockspace(daemon: &Daemon, spec: &LockspaceSpec) -> Result<()> {
    let timeouts = match spec.io_timeout_seconds {
        Some(io) => daemon.config.timeouts_with_io(io),
        None => daemon.timeouts,
    };
    let disk = daemon.open_disk(&spec.path, spec.offset)?;
    let watchdog = daemon.watchdog_for(&spec.name, spec.host_id).await?;
    daemon
        .lockspaces
        .add(
            &spec.name,
            spec.host_id,
            disk,
            DEFAULT_MAX_HOSTS,
            timeouts,
            watchdog,
        )
        .await?;
    Ok(())
}

pub async fn rem_lockspace(daemon: &Daemon, name: &str) -> Result<()> {
    if daemon.tokens.lockspace_in_use(name) {
        return Err(Error::LockspaceBusy(name.to_string()));
    }
    daemon.lockspaces.remove(name).await
}

/// ACQUIRE: all requested leases or none. A failure releases everything
/// this call acquired and surfaces the first fatal error.
pub async fn acquire(
    daemon: &Arc<Daemon>,
    client: &Arc<Client>,
    req: &AcquireRequest,
) -> Result<Vec<u64>> {
    let pid = client.pid.ok_or(Error::NotRegistered)?;
    let mut acquired: Vec<u64> = Vec::new();

    for spec in &req.resources {
        match acquire_one(daemon, client.id, pid, spec, req.shared, req.acquire_lver).await {
            Ok(id) => acquired.push(id),
            Err(err) => {
                warn!(
                    resource = %spec.name,
                    %err,
                    "acquire failed, rolling back the batch"
                );
                for id in acquired {
                    if let Some(entry) = daemon.tokens.get(id) {
                        if let Err(rollback_err) =
                            release_token_entry(daemon, &entry, None).await
                        {
                            warn!(
                                resource = %entry.token.resource_name,
                                %rollback_err,
                                "rollback release failed"
                            );
                        }
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(acquired)
}

async fn acquire_one(
    daemon: &Arc<Daemon>,
    client_id: u64,
    pid: i32,
    spec: &ResourceSpec,
    shared: bool,
    acquire_lver: u64,
) -> Result<u64> {
    let ls = daemon
        .lockspaces
        .get(&spec.lockspace)
        .ok_or_else(|| Error::UnknownLockspace(spec.lockspace.clone()))?;
    if !ls.renewal_current() {
        return Err(Error::LockspaceStale(spec.lockspace.clone()));
    }

    // a fresh saved token of the same owner short-circuits the ballot
    if let Some(saved) = daemon.tokens.take_saved(&spec.name, client_id, pid) {
        info!(resource = %spec.name, pid, "reacquired saved lease");
        return Ok(saved.id);
    }

    let disk = daemon.open_disk(&spec.path, spec.offset)?;
    let sector_size = disk.sector_size();
    let mut token = Token::new(
        spec.lockspace.clone(),
        spec.name.clone(),
        vec![disk],
        sector_size,
        ls.host_id(),
        ls.generation(),
        ls.timeouts(),
    )?;

    let id = daemon
        .tokens
        .allocate(client_id, pid, token.clone(), shared)?;
    daemon.tokens.set_state(id, TokenState::Opening);
    daemon.tokens.set_state(id, TokenState::Acquiring);

    let result = if shared {
        paxos_lease::acquire_shared(&token).await.map(|()| None)
    } else {
        let opts = AcquireOptions {
            acquire_lver,
            ..Default::default()
        };
        paxos_lease::acquire(&mut token, &daemon.lockspaces, opts, &daemon.cancel)
            .await
            .map(|(leader, _)| Some(leader))
    };

    match result {
        Ok(leader) => {
            daemon.tokens.update(id, |entry| {
                entry.token = token.clone();
                entry.leader = leader;
                entry.state = TokenState::Held;
            });
            Ok(id)
        }
        Err(err) => {
            if token.retract {
                // we may be the committed owner anyway; make sure not
                if let Err(retract_err) = paxos_lease::release(&mut token, None, None).await {
                    warn!(
                        resource = %spec.name,
                        %retract_err,
                        "retract release failed"
                    );
                }
            }
            daemon.tokens.remove(id);
            Err(err.into())
        }
    }
}

/// RELEASE for one or more held tokens. The in-memory token is gone when
/// this returns, whatever the disk said.
pub async fn release(daemon: &Daemon, client: &Arc<Client>, req: &ReleaseRequest) -> Result<()> {
    let pid = client.pid.ok_or(Error::NotRegistered)?;
    let entries: Vec<TokenEntry> = if req.all {
        daemon
            .tokens
            .by_client(client.id)
            .into_iter()
            .filter(|e| e.state == TokenState::Held)
            .collect()
    } else {
        let mut found = Vec::new();
        for name in &req.resources {
            found.push(daemon.tokens.find(pid, name).ok_or_else(|| {
                Error::UnknownLease {
                    pid,
                    resource: name.clone(),
                }
            })?);
        }
        found
    };

    let mut first_err = None;
    for entry in entries {
        if req.save_for_reacquire && !entry.token.retract && !entry.migrating {
            daemon.tokens.save_for_reacquire(entry.id);
            continue;
        }
        let rename = req
            .rename
            .as_ref()
            .filter(|r| r.resource == entry.token.resource_name)
            .map(|r| r.new_name.as_str());
        if let Err(err) = release_token_entry(daemon, &entry, rename).await {
            warn!(resource = %entry.token.resource_name, %err, "release failed");
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Drop one token: run the disk release (or just forget it when the lease
/// has migrated away), then remove it from the table unconditionally.
pub async fn release_token_entry(
    daemon: &Daemon,
    entry: &TokenEntry,
    rename: Option<&str>,
) -> Result<()> {
    daemon.tokens.set_state(entry.id, TokenState::Releasing);
    let result = if entry.migrating {
        // the destination host owns the lease now
        Ok(())
    } else if entry.shared {
        paxos_lease::clear_shared(&entry.token)
            .await
            .map_err(Error::from)
    } else {
        let mut token = entry.token.clone();
        paxos_lease::release(&mut token, entry.leader.as_ref(), rename)
            .await
            .map(|_| ())
            .map_err(Error::from)
    };
    daemon.tokens.remove(entry.id);
    result
}

/// MIGRATE: freeze a held token for handover and report what the
/// destination's SETOWNER needs. A ballot already in flight is never
/// disturbed; the request record path covers live contention.
pub async fn migrate(
    daemon: &Daemon,
    client: &Arc<Client>,
    req: &MigrateRequest,
) -> Result<MigrateReply> {
    let pid = client.pid.ok_or(Error::NotRegistered)?;
    let entry = daemon
        .tokens
        .find(pid, &req.resource)
        .ok_or_else(|| Error::UnknownLease {
            pid,
            resource: req.resource.clone(),
        })?;
    if entry.state != TokenState::Held {
        return Err(Error::Busy);
    }
    let leader = entry
        .leader
        .ok_or_else(|| Error::BadRequest("no committed leader for resource".into()))?;

    daemon.tokens.update(entry.id, |e| e.migrating = true);
    info!(resource = %req.resource, lver = leader.lver, "lease frozen for migration");
    Ok(MigrateReply {
        resource: req.resource.clone(),
        lver: leader.lver,
        owner_generation: entry.token.host_generation,
    })
}

/// SETOWNER: adopt leases migrated in from `source`. For each resource the
/// leader must still name the pre-migration owner; a forced, self-targeted
/// ballot then rewrites ownership to this host without the lease ever
/// passing through FREE.
pub async fn set_owner(
    daemon: &Arc<Daemon>,
    client: &Arc<Client>,
    req: &SetOwnerRequest,
) -> Result<Vec<u64>> {
    let pid = client.pid.ok_or(Error::NotRegistered)?;
    let mut adopted = Vec::new();

    for spec in &req.resources {
        let ls = daemon
            .lockspaces
            .get(&spec.lockspace)
            .ok_or_else(|| Error::UnknownLockspace(spec.lockspace.clone()))?;
        if !ls.renewal_current() {
            return Err(Error::LockspaceStale(spec.lockspace.clone()));
        }

        let disk = daemon.open_disk(&spec.path, spec.offset)?;
        let sector_size = disk.sector_size();
        let mut token = Token::new(
            spec.lockspace.clone(),
            spec.name.clone(),
            vec![disk],
            sector_size,
            ls.host_id(),
            ls.generation(),
            ls.timeouts(),
        )?;

        let leader = paxos_lease::leader_read(&token).await.map_err(Error::from)?;
        let already_ours =
            leader.owner_id == ls.host_id() && leader.owner_generation == ls.generation();
        if !already_ours
            && (leader.owner_id != req.source_host_id
                || leader.owner_generation != req.source_generation)
        {
            return Err(Error::BadRequest(format!(
                "resource {:?} owned by {}:{}, not migration source {}:{}",
                spec.name,
                leader.owner_id,
                leader.owner_generation,
                req.source_host_id,
                req.source_generation
            )));
        }

        let id = daemon.tokens.allocate(client.id, pid, token.clone(), false)?;
        daemon.tokens.set_state(id, TokenState::Acquiring);

        let result = if already_ours {
            Ok((leader, ondisk::Dblock::default()))
        } else {
            let opts = AcquireOptions {
                force: true,
                ..Default::default()
            };
            paxos_lease::acquire(&mut token, &daemon.lockspaces, opts, &daemon.cancel).await
        };

        match result {
            Ok((new_leader, _)) => {
                daemon.tokens.update(id, |entry| {
                    entry.token = token.clone();
                    entry.leader = Some(new_leader);
                    entry.state = TokenState::Held;
                });
                info!(
                    resource = %spec.name,
                    lver = new_leader.lver,
                    "migrated lease adopted"
                );
                adopted.push(id);
            }
            Err(err) => {
                if token.retract {
                    let _ = paxos_lease::release(&mut token, None, None).await;
                }
                daemon.tokens.remove(id);
                return Err(err.into());
            }
        }
    }
    Ok(adopted)
}

/// REQUEST: write the advisory request record for a resource we do not
/// hold, asking its owner to yield.
pub async fn force_request(daemon: &Daemon, req: &ForceRequest) -> Result<()> {
    let force_mode =
        ForceMode::from_u32(req.force_mode).ok_or_else(|| {
            Error::BadRequest(format!("unknown force mode {}", req.force_mode))
        })?;
    let spec = &req.resource;
    let disk = daemon.open_disk(&spec.path, spec.offset)?;
    let sector_size = disk.sector_size();
    let token = Token::new(
        spec.lockspace.clone(),
        spec.name.clone(),
        vec![disk],
        sector_size,
        1,
        0,
        daemon.timeouts,
    )?;

    let lver = if req.lver != 0 {
        req.lver
    } else {
        paxos_lease::leader_read(&token).await.map_err(Error::from)?.lver
    };
    paxos_lease::request_write(&token, &RequestRecord::new(lver, force_mode))
        .await
        .map_err(Error::from)
}

/// A registered client went away: its pid is gone, so every lease it held
/// goes back. In-flight acquires have already completed by the time the
/// connection task runs this.
pub async fn client_dead(daemon: &Daemon, client_id: u64) {
    let entries = daemon.tokens.by_client(client_id);
    for entry in entries {
        match entry.state {
            TokenState::Held | TokenState::Acquiring | TokenState::Releasing => {
                info!(
                    resource = %entry.token.resource_name,
                    pid = entry.pid,
                    "releasing lease of dead pid"
                );
                if let Err(err) = release_token_entry(daemon, &entry, None).await {
                    warn!(
                        resource = %entry.token.resource_name,
                        %err,
                        "release for dead pid failed"
                    );
                }
            }
            TokenState::SavedForReacquire => {}
            _ => {
                daemon.tokens.remove(entry.id);
            }
        }
    }
    daemon.clients.remove(client_id);
}
