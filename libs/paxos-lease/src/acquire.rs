//! The acquire path: ownership checks, the wait-for-dead loop against the
//! delta-lease engine, and ballot retries up to the leader commit.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use delta_lease::{lease as delta, monotime, HostStatus};
use ondisk::leader::{LEADER_FLAG_SHORT_HOLD, LEASE_FREE};
use ondisk::{Dblock, LeaderRecord};

use crate::ballot::run_ballot;
use crate::disk::{lease_read, leader_read, read_dblock, write_new_leader};
use crate::errors::{Error, Result};
use crate::token::Token;
use crate::HostLiveness;

/// Ballot retries (mbal bumps) before the engine gives up.
const BALLOT_RETRY_MAX: u32 = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Skip the ownership checks and run the ballot unconditionally.
    pub force: bool,
    /// Stamp SHORT_HOLD on the committed leader: we intend to release soon
    /// and peers should retry rather than start a seizure wait.
    pub short_hold: bool,
    /// Fail with `AcquireOwnedRetry` instead of waiting for a live owner
    /// to die.
    pub owner_nowait: bool,
    /// Require the current leader to be exactly this lver (0 = any).
    pub acquire_lver: u64,
    /// Rewrite num_hosts on commit (0 = keep).
    pub new_num_hosts: u64,
}

enum OwnerWait {
    RunBallot,
    Restart,
}

/// Acquire the resource for `(token.host_id, token.host_generation)`.
///
/// Returns the committed leader and our final dblock. The committed owner
/// can legitimately be another host whose published proposal we adopted;
/// that surfaces as [`Error::AcquireOther`].
pub async fn acquire(
    token: &mut Token,
    liveness: &dyn HostLiveness,
    opts: AcquireOptions,
    cancel: &CancellationToken,
) -> Result<(LeaderRecord, Dblock)> {
    debug!(
        space = %token.space_name,
        resource = %token.resource_name,
        host_id = token.host_id,
        host_generation = token.host_generation,
        "paxos acquire begin"
    );

    'restart: loop {
        let area = lease_read(token).await?;
        let cur_leader = area.leader;
        let mut reuse_initial_read = true;

        if !opts.force {
            if opts.acquire_lver != 0 && cur_leader.lver != opts.acquire_lver {
                return Err(Error::AcquireLver {
                    wanted: opts.acquire_lver,
                    found: cur_leader.lver,
                });
            }

            if cur_leader.timestamp != LEASE_FREE {
                if cur_leader.owner_id == token.host_id
                    && cur_leader.owner_generation == token.host_generation
                {
                    debug!(
                        resource = %token.resource_name,
                        lver = cur_leader.lver,
                        "already owned by this host"
                    );
                    return Ok((cur_leader, area.our_dblock));
                }

                if cur_leader.owner_id == token.host_id
                    && cur_leader.owner_generation < token.host_generation
                {
                    // our own stale generation never released it; take it back
                    debug!(
                        resource = %token.resource_name,
                        old_generation = cur_leader.owner_generation,
                        "owned by a previous life of this host"
                    );
                } else {
                    match wait_for_owner_dead(token, liveness, &cur_leader, &opts, cancel).await? {
                        OwnerWait::RunBallot => reuse_initial_read = false,
                        OwnerWait::Restart => continue 'restart,
                    }
                }
            } else {
                debug!(resource = %token.resource_name, lver = cur_leader.lver, "leader free");
            }
        }

        // The ballot contends for cur_leader.lver + 1, derived from the
        // leader as initially read. Rereading here and adding one would be
        // wrong: another host may have committed us as the owner of
        // next_lver in the meantime.
        let next_lver = cur_leader.lver + 1;
        let mut our_mbal = if area.max_mbal == 0 {
            token.host_id
        } else {
            // distinct residue class mod max_hosts for every host
            area.max_mbal - (area.max_mbal % cur_leader.max_hosts)
                + cur_leader.max_hosts
                + token.host_id
        };

        let mut attempts = 0u32;
        loop {
            let tmp_leader = if reuse_initial_read {
                reuse_initial_read = false;
                cur_leader
            } else {
                leader_read(token).await?
            };

            if tmp_leader.lver == next_lver {
                // someone committed next_lver while we were contending;
                // possibly with our own proposal
                if tmp_leader.owner_id == token.host_id
                    && tmp_leader.owner_generation == token.host_generation
                {
                    info!(
                        resource = %token.resource_name,
                        lver = next_lver,
                        write_id = tmp_leader.write_id,
                        "owner is our proposal, committed by another host"
                    );
                    let our_dblock = read_dblock(token, &token.disks[0], token.host_id)
                        .await
                        .map(|(db, _)| db)
                        .unwrap_or_default();
                    return Ok((tmp_leader, our_dblock));
                }
                warn!(
                    resource = %token.resource_name,
                    lver = next_lver,
                    owner_id = tmp_leader.owner_id,
                    owner_generation = tmp_leader.owner_generation,
                    "lease committed to another owner"
                );
                return Err(Error::AcquireOwned {
                    owner_id: tmp_leader.owner_id,
                    owner_generation: tmp_leader.owner_generation,
                });
            }
            if tmp_leader.lver > next_lver {
                debug!(
                    resource = %token.resource_name,
                    next_lver,
                    disk_lver = tmp_leader.lver,
                    "leader moved past our ballot, restarting"
                );
                continue 'restart;
            }
            if !tmp_leader.same_lease_state(&cur_leader) {
                debug!(resource = %token.resource_name, "leader changed, restarting");
                continue 'restart;
            }

            match run_ballot(token, cur_leader.num_hosts, next_lver, our_mbal).await {
                Err(err) if err.is_ballot_retry() => {
                    attempts += 1;
                    if attempts > BALLOT_RETRY_MAX {
                        return Err(Error::BallotRetries);
                    }
                    let us = rand::thread_rng().gen_range(0..1_000_000);
                    debug!(
                        resource = %token.resource_name,
                        lver = next_lver,
                        delay_us = us,
                        "ballot aborted, retrying with larger mbal"
                    );
                    sleep(Duration::from_micros(us)).await;
                    our_mbal += cur_leader.max_hosts;
                    continue;
                }
                Err(err) => return Err(err),
                Ok(outcome) => {
                    // an exclusive commit must not run over live shared
                    // claims from other hosts
                    for (host_id, generation) in &outcome.shared {
                        if *host_id == token.host_id {
                            continue;
                        }
                        if shared_claim_live(token, liveness, *host_id, *generation).await {
                            warn!(
                                resource = %token.resource_name,
                                host_id,
                                generation,
                                "live shared claim blocks exclusive acquire"
                            );
                            return Err(Error::AcquireSharedHeld { host_id: *host_id });
                        }
                    }

                    let mut new_leader = cur_leader;
                    new_leader.lver = outcome.dblock.lver;
                    new_leader.owner_id = outcome.dblock.inp;
                    new_leader.owner_generation = outcome.dblock.inp2;
                    new_leader.timestamp = outcome.dblock.inp3;
                    new_leader.write_id = token.host_id;
                    new_leader.write_generation = token.host_generation;
                    new_leader.write_timestamp = monotime();
                    new_leader.io_timeout = token.timeouts.io_timeout_seconds();
                    if opts.new_num_hosts != 0 {
                        new_leader.num_hosts = opts.new_num_hosts;
                    }
                    if new_leader.owner_id == token.host_id {
                        // only meaningful when committing ourselves; for a
                        // foreign owner we cannot know their intent
                        if opts.short_hold {
                            new_leader.flags |= LEADER_FLAG_SHORT_HOLD;
                        } else {
                            new_leader.flags &= !LEADER_FLAG_SHORT_HOLD;
                        }
                    }

                    if let Err(err) = write_new_leader(token, &mut new_leader).await {
                        token.retract = true;
                        return Err(err);
                    }

                    if new_leader.owner_id != token.host_id {
                        info!(
                            resource = %token.resource_name,
                            lver = new_leader.lver,
                            owner_id = new_leader.owner_id,
                            owner_generation = new_leader.owner_generation,
                            "committed another host's proposal"
                        );
                        return Err(Error::AcquireOther {
                            owner_id: new_leader.owner_id,
                            owner_generation: new_leader.owner_generation,
                        });
                    }

                    info!(
                        resource = %token.resource_name,
                        lver = new_leader.lver,
                        owner_id = new_leader.owner_id,
                        owner_generation = new_leader.owner_generation,
                        "lease acquired"
                    );
                    return Ok((new_leader, outcome.dblock));
                }
            }
        }
    }
}

/// Watch the current owner's delta lease until it is provably dead (run the
/// ballot), it shows life (error), or the leader itself changes (restart).
async fn wait_for_owner_dead(
    token: &Token,
    liveness: &dyn HostLiveness,
    cur_leader: &LeaderRecord,
    opts: &AcquireOptions,
    cancel: &CancellationToken,
) -> Result<OwnerWait> {
    let space = cur_leader.space_name_str();
    let dd = liveness
        .lockspace_disk(&space)
        .await
        .ok_or_else(|| Error::AcquireLockspace(space.clone()))?;

    let monitor: Option<HostStatus> = liveness.host_info(&space, cur_leader.owner_id).await;
    let (wait_start, mut last_timestamp) = match monitor {
        Some(hs)
            if hs.last_check != 0
                && hs.last_live != 0
                && hs.matches_owner(cur_leader.owner_id, cur_leader.owner_generation) =>
        {
            (hs.last_live, hs.timestamp)
        }
        _ => (monotime(), 0),
    };

    debug!(
        resource = %token.resource_name,
        owner_id = cur_leader.owner_id,
        owner_generation = cur_leader.owner_generation,
        wait_start,
        "watching owner's delta lease"
    );

    loop {
        let owner_delta = delta::leader_read(&dd, &token.timeouts, cur_leader.owner_id).await?;

        // A host_id cannot be freed or reacquired in less than the dead
        // interval, so any of these states proves the owner's hold lapsed.
        if owner_delta.is_free() {
            debug!(resource = %token.resource_name, owner_id = cur_leader.owner_id, "owner delta lease free");
            return Ok(OwnerWait::RunBallot);
        }
        if owner_delta.owner_id != cur_leader.owner_id
            || owner_delta.owner_generation > cur_leader.owner_generation
        {
            debug!(
                resource = %token.resource_name,
                owner_id = cur_leader.owner_id,
                delta_owner = owner_delta.owner_id,
                delta_generation = owner_delta.owner_generation,
                "owner's host_id moved on"
            );
            return Ok(OwnerWait::RunBallot);
        }

        if last_timestamp == 0 {
            last_timestamp = owner_delta.timestamp;
        } else {
            let monitor_live = monitor.map(|hs| hs.live_on_last_check()).unwrap_or(false);
            if owner_delta.timestamp != last_timestamp || monitor_live {
                // The owner renews. One escape: a released lease whose
                // release was overwritten by a third host committing the
                // owner back in. The owner marks that case in its dblock.
                if cur_leader.write_id != cur_leader.owner_id {
                    if let Ok((db, _)) =
                        read_dblock(token, &token.disks[0], cur_leader.owner_id).await
                    {
                        if db.is_released() {
                            info!(
                                resource = %token.resource_name,
                                owner_id = cur_leader.owner_id,
                                "owner released under a foreign writer"
                            );
                            return Ok(OwnerWait::RunBallot);
                        }
                    }
                }
                return Err(Error::AcquireIdLive {
                    owner_id: cur_leader.owner_id,
                    owner_generation: cur_leader.owner_generation,
                });
            }

            let now = monotime();
            let peer_io_timeout = monitor
                .map(|hs| hs.io_timeout)
                .filter(|io| *io != 0)
                .unwrap_or(owner_delta.io_timeout);
            let dead_after = token.timeouts.host_dead_seconds(peer_io_timeout);
            if now.saturating_sub(wait_start) > dead_after {
                info!(
                    resource = %token.resource_name,
                    owner_id = cur_leader.owner_id,
                    owner_generation = cur_leader.owner_generation,
                    silent = now.saturating_sub(wait_start),
                    dead_after,
                    "owner declared dead"
                );
                return Ok(OwnerWait::RunBallot);
            }
            if opts.owner_nowait {
                return Err(Error::AcquireOwnedRetry);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep(Duration::from_secs(1)) => {}
        }

        // if the leader changes while we wait, start over
        let tmp_leader = leader_read(token).await?;
        if !tmp_leader.same_lease_state(cur_leader) || tmp_leader.write_id != cur_leader.write_id {
            debug!(resource = %token.resource_name, "leader changed during owner wait");
            return Ok(OwnerWait::Restart);
        }
    }
}

/// A shared claim blocks an exclusive acquire while its generation is the
/// holder's current one and the holder is not provably dead.
async fn shared_claim_live(
    token: &Token,
    liveness: &dyn HostLiveness,
    host_id: u64,
    generation: u64,
) -> bool {
    match liveness.host_info(&token.space_name, host_id).await {
        Some(hs) if hs.owner_generation == generation => {
            !hs.maybe_dead(monotime(), &token.timeouts)
        }
        // stale generation or a host we have never observed: the claim
        // cannot be current
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk;
    use crate::testutil::{host_token, scratch_lockspace, scratch_resource, test_timeouts, FakeLiveness};

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_uncontested_acquire() {
        let (_file, mut token) = scratch_resource(3).await;
        let liveness = FakeLiveness::new(None);

        let (leader, dblock) = acquire(&mut token, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap();

        assert_eq!(leader.lver, 1);
        assert_eq!(leader.owner_id, 1);
        assert_eq!(leader.owner_generation, 1);
        assert_eq!(leader.write_id, 1);
        assert_ne!(leader.timestamp, LEASE_FREE);
        // an empty area means max_mbal == 0, so our first mbal is host_id
        assert_eq!(dblock.mbal, 1);
        assert_eq!(dblock.bal, 1);
        assert_eq!(dblock.inp, 1);
        assert_eq!(dblock.inp2, 1);
        assert!(!token.retract);

        let on_disk = disk::leader_read(&token).await.unwrap();
        assert!(on_disk.same_lease_state(&leader));
    }

    #[tokio::test]
    async fn test_reacquire_already_ours_is_noop() {
        let (_file, mut token) = scratch_resource(3).await;
        let liveness = FakeLiveness::new(None);
        let (first, _) = acquire(&mut token, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap();
        let (second, _) = acquire(&mut token, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap();
        // same commit, no new ballot
        assert_eq!(second.lver, first.lver);
        assert_eq!(second.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn test_contested_mbal_abort_then_residue_retry() {
        let (file, mut token) = scratch_resource(3).await;

        // host 2 has already written its phase-1 dblock for lver 1
        let peer = host_token(&file, 2, 1);
        let mut peer_db = Dblock {
            mbal: 2,
            lver: 1,
            ..Default::default()
        };
        disk::write_dblock(&peer, &peer.disks[0], 2, &mut peer_db)
            .await
            .unwrap();

        // a ballot at mbal 1 must abort against the peer's mbal 2
        let err = crate::ballot::run_ballot(&mut token, 3, 1, 1).await.unwrap_err();
        assert!(matches!(err, Error::DblockMbal { host_id: 2, seen: 2 }));

        // the full acquire observes max_mbal 2 and moves to the next
        // residue-class slot: 2000 + host_id
        let liveness = FakeLiveness::new(None);
        let (leader, dblock) = acquire(&mut token, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap();
        assert_eq!(dblock.mbal, 2001);
        assert_eq!(leader.lver, 1);
        assert_eq!(leader.owner_id, 1);
    }

    #[tokio::test]
    async fn test_adopts_published_proposal_of_crashed_host() {
        let (file, _token) = scratch_resource(3).await;

        // host 1 finished phase 2 for lver 1 and then went silent before
        // committing a leader
        let crashed = host_token(&file, 1, 7);
        let mut crashed_db = Dblock {
            mbal: 1,
            bal: 1,
            inp: 1,
            inp2: 7,
            inp3: 4242,
            lver: 1,
            ..Default::default()
        };
        disk::write_dblock(&crashed, &crashed.disks[0], 1, &mut crashed_db)
            .await
            .unwrap();

        // host 2 must adopt and commit host 1's proposal, then report that
        // it did not acquire for itself
        let mut token2 = host_token(&file, 2, 1);
        let liveness = FakeLiveness::new(None);
        let err = acquire(&mut token2, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AcquireOther {
                owner_id: 1,
                owner_generation: 7
            }
        ));

        let on_disk = disk::leader_read(&crashed).await.unwrap();
        assert_eq!(on_disk.lver, 1);
        assert_eq!(on_disk.owner_id, 1);
        assert_eq!(on_disk.owner_generation, 7);
        assert_eq!(on_disk.timestamp, 4242);
        assert_eq!(on_disk.write_id, 2);
    }

    #[tokio::test]
    async fn test_dead_owner_seized() {
        let (file, mut token) = scratch_resource(8).await;
        let (_lsfile, dd) = scratch_lockspace().await;

        // host 5 owns the lease and its delta lease, then stops renewing
        let peer_delta = delta::acquire(&dd, &test_timeouts(), 5).await.unwrap();
        let mut token5 = host_token(&file, 5, peer_delta.owner_generation);
        let liveness5 = FakeLiveness::new(Some(dd.clone()));
        let (leader5, _) = acquire(&mut token5, &liveness5, AcquireOptions::default(), &cancel())
            .await
            .unwrap();

        let liveness = FakeLiveness::new(Some(dd.clone()));
        let now = monotime();
        liveness.set_host(
            5,
            HostStatus {
                owner_id: 5,
                owner_generation: peer_delta.owner_generation,
                timestamp: peer_delta.timestamp,
                io_timeout: 10,
                last_check: now,
                last_live: now.saturating_sub(100),
            },
        );

        let (leader, _) = acquire(&mut token, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap();
        assert_eq!(leader.lver, leader5.lver + 1);
        assert_eq!(leader.owner_id, 1);
        assert_eq!(leader.owner_generation, 1);
        assert_eq!(leader.write_id, 1);
    }

    #[tokio::test]
    async fn test_live_owner_refuses_seizure() {
        let (file, mut token) = scratch_resource(8).await;
        let (_lsfile, dd) = scratch_lockspace().await;

        let peer_delta = delta::acquire(&dd, &test_timeouts(), 5).await.unwrap();
        let mut token5 = host_token(&file, 5, peer_delta.owner_generation);
        let liveness5 = FakeLiveness::new(Some(dd.clone()));
        acquire(&mut token5, &liveness5, AcquireOptions::default(), &cancel())
            .await
            .unwrap();

        // the monitor saw host 5's timestamp advance on its last pass
        let liveness = FakeLiveness::new(Some(dd.clone()));
        let now = monotime();
        liveness.set_host(
            5,
            HostStatus {
                owner_id: 5,
                owner_generation: peer_delta.owner_generation,
                timestamp: peer_delta.timestamp,
                io_timeout: 10,
                last_check: now,
                last_live: now,
            },
        );

        let err = acquire(&mut token, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AcquireIdLive {
                owner_id: 5,
                ..
            }
        ));

        // no phase bits for host 1 anywhere on disk
        let (our_db, _) = disk::read_dblock(&token, &token.disks[0], 1).await.unwrap();
        assert_eq!(our_db, Dblock::default());
    }

    #[tokio::test]
    async fn test_owner_nowait_returns_retry() {
        let (file, mut token) = scratch_resource(8).await;
        let (_lsfile, dd) = scratch_lockspace().await;

        let peer_delta = delta::acquire(&dd, &test_timeouts(), 5).await.unwrap();
        let mut token5 = host_token(&file, 5, peer_delta.owner_generation);
        let liveness5 = FakeLiveness::new(Some(dd.clone()));
        acquire(&mut token5, &liveness5, AcquireOptions::default(), &cancel())
            .await
            .unwrap();

        // no monitor data: the wait loop must learn the timestamp first,
        // then bail instead of waiting out the dead interval
        let liveness = FakeLiveness::new(Some(dd.clone()));
        let timeouts_1s = delta_lease::Timeouts::new(10).with_host_dead_override(1000);
        token.timeouts = timeouts_1s;
        let opts = AcquireOptions {
            owner_nowait: true,
            ..Default::default()
        };
        let err = acquire(&mut token, &liveness, opts, &cancel()).await.unwrap_err();
        assert!(matches!(err, Error::AcquireOwnedRetry));
    }

    #[tokio::test]
    async fn test_acquire_lver_mismatch() {
        let (file, _token) = scratch_resource(3).await;
        let mut token2 = host_token(&file, 2, 1);
        let liveness = FakeLiveness::new(None);
        let opts = AcquireOptions {
            acquire_lver: 9,
            ..Default::default()
        };
        let err = acquire(&mut token2, &liveness, opts, &cancel()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AcquireLver {
                wanted: 9,
                found: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_self_generation_reacquired_without_owner_wait() {
        let (file, _token) = scratch_resource(3).await;

        // generation 1 of this host acquired and never released
        let mut old_self = host_token(&file, 1, 1);
        let liveness = FakeLiveness::new(None);
        let (old_leader, _) = acquire(&mut old_self, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap();

        // generation 2 takes it back with a ballot, no liveness wait
        let mut new_self = host_token(&file, 1, 2);
        let (leader, _) = acquire(&mut new_self, &liveness, AcquireOptions::default(), &cancel())
            .await
            .unwrap();
        assert_eq!(leader.lver, old_leader.lver + 1);
        assert_eq!(leader.owner_id, 1);
        assert_eq!(leader.owner_generation, 2);
    }
}
