//! Leader and dblock disk plumbing shared by the paxos operations,
//! including the majority rules for replicated resources.

use sector_io::{read_iobuf, read_sectors, write_sector, SyncDisk};
use tracing::{debug, warn};

use ondisk::dblock::MODE_BLOCK_SHARED;
use ondisk::leader::{PAXOS_LEADER_CLEAR, PAXOS_LEADER_MAGIC, PAXOS_LEADER_VERSION_MAJOR};
use ondisk::{dblock_sector, name_bytes, Dblock, LeaderRecord, ModeBlock, LEADER_SECTOR};

use crate::errors::{Error, Result};
use crate::token::Token;

/// Strict majority of `num` disks.
pub(crate) fn majority(num: usize, count: usize) -> bool {
    count * 2 > num
}

/// Write `host_id`'s dblock on one disk, stamping the checksum. With
/// `preserve_shared` set, our SHARED mode block rides along in the same
/// sector so a ballot write cannot clobber the shared claim.
pub(crate) async fn write_dblock(
    token: &Token,
    disk: &SyncDisk,
    host_id: u64,
    db: &mut Dblock,
) -> Result<()> {
    let mut sector = vec![0u8; token.sector_size as usize];
    db.encode_into(&mut sector)?;
    if token.preserve_shared {
        ModeBlock {
            flags: MODE_BLOCK_SHARED,
            generation: token.host_generation,
        }
        .encode_into(&mut sector)?;
    }
    write_sector(
        disk,
        token.sector_size,
        dblock_sector(host_id),
        &sector,
        token.io_timeout(),
    )
    .await?;
    Ok(())
}

/// Write our dblock on every disk; a strict majority must succeed.
pub(crate) async fn write_dblock_all(token: &Token, db: &mut Dblock) -> Result<()> {
    let mut wrote = 0;
    let mut timeout: Option<Error> = None;
    for disk in &token.disks {
        match write_dblock(token, disk, token.host_id, db).await {
            Ok(()) => wrote += 1,
            Err(err) => {
                warn!(resource = %token.resource_name, disk = %disk.path().display(), %err, "dblock write failed");
                if matches!(&err, Error::Io(e) if e.is_timeout()) {
                    timeout = Some(err);
                }
            }
        }
    }
    if !majority(token.num_disks(), wrote) {
        return Err(timeout.unwrap_or(Error::DblockWrite));
    }
    Ok(())
}

pub(crate) async fn read_dblock(
    token: &Token,
    disk: &SyncDisk,
    host_id: u64,
) -> Result<(Dblock, u32)> {
    let buf = read_sectors(
        disk,
        token.sector_size,
        dblock_sector(host_id),
        1,
        token.io_timeout(),
    )
    .await?;
    Ok(Dblock::decode_from(&buf)?)
}

async fn write_leader_one(token: &Token, disk: &SyncDisk, lr: &mut LeaderRecord) -> Result<()> {
    let mut sector = vec![0u8; token.sector_size as usize];
    lr.encode_into(&mut sector)?;
    write_sector(
        disk,
        token.sector_size,
        LEADER_SECTOR,
        &sector,
        token.io_timeout(),
    )
    .await?;
    Ok(())
}

/// Commit a leader on a strict majority of disks.
pub(crate) async fn write_new_leader(token: &Token, lr: &mut LeaderRecord) -> Result<()> {
    let mut wrote = 0;
    let mut timeout: Option<Error> = None;
    for disk in &token.disks {
        match write_leader_one(token, disk, lr).await {
            Ok(()) => wrote += 1,
            Err(err) => {
                warn!(resource = %token.resource_name, disk = %disk.path().display(), %err, "leader write failed");
                if matches!(&err, Error::Io(e) if e.is_timeout()) {
                    timeout = Some(err);
                }
            }
        }
    }
    if !majority(token.num_disks(), wrote) {
        return Err(timeout.unwrap_or(Error::LeaderWrite));
    }
    debug!(
        resource = %token.resource_name,
        lver = lr.lver,
        owner_id = lr.owner_id,
        owner_generation = lr.owner_generation,
        timestamp = lr.timestamp,
        "leader written"
    );
    Ok(())
}

/// Full leader verification against the token's expectations.
pub(crate) fn verify_leader(token: &Token, lr: &LeaderRecord, computed: u32) -> Result<()> {
    if lr.magic == PAXOS_LEADER_CLEAR || lr.magic != PAXOS_LEADER_MAGIC {
        return Err(Error::LeaderMagic { magic: lr.magic });
    }
    if lr.version & 0xffff_0000 != PAXOS_LEADER_VERSION_MAJOR {
        return Err(Error::LeaderVersion {
            version: lr.version,
        });
    }
    if lr.space_name != name_bytes(&token.space_name) {
        return Err(Error::LeaderLockspace {
            found: lr.space_name_str(),
            expected: token.space_name.clone(),
        });
    }
    if lr.resource_name != name_bytes(&token.resource_name) {
        return Err(Error::LeaderResource {
            found: lr.resource_name_str(),
            expected: token.resource_name.clone(),
        });
    }
    if lr.num_hosts < token.host_id {
        return Err(Error::LeaderNumHosts {
            num_hosts: lr.num_hosts,
            host_id: token.host_id,
        });
    }
    lr.verify_checksum(computed)?;
    Ok(())
}

async fn read_leader_one(token: &Token, disk: &SyncDisk) -> Result<LeaderRecord> {
    let buf = read_sectors(disk, token.sector_size, LEADER_SECTOR, 1, token.io_timeout()).await?;
    let (lr, computed) = LeaderRecord::decode_from(&buf)?;
    verify_leader(token, &lr, computed)?;
    Ok(lr)
}

/// Read and verify the leader. With replicated disks, the result is a
/// leader that reads back identically on a strict majority.
pub async fn leader_read(token: &Token) -> Result<LeaderRecord> {
    if token.num_disks() == 1 {
        return read_leader_one(token, &token.disks[0]).await;
    }

    let mut leaders: Vec<LeaderRecord> = Vec::new();
    let mut reads = 0;
    for disk in &token.disks {
        match read_leader_one(token, disk).await {
            Ok(lr) => {
                reads += 1;
                leaders.push(lr);
            }
            Err(err) => {
                warn!(resource = %token.resource_name, disk = %disk.path().display(), %err, "leader read failed");
            }
        }
    }
    if !majority(token.num_disks(), reads) {
        return Err(Error::LeaderRead);
    }
    majority_leader(token, &leaders).ok_or(Error::LeaderDiff)
}

fn majority_leader(token: &Token, leaders: &[LeaderRecord]) -> Option<LeaderRecord> {
    for candidate in leaders {
        let reps = leaders
            .iter()
            .filter(|other| candidate.same_lease_state(other))
            .count();
        if majority(token.num_disks(), reps) {
            return Some(*candidate);
        }
    }
    None
}

/// Everything the acquire path needs from its initial read of the whole
/// lease area: the verified leader, our own dblock, and the largest mbal
/// published by any host.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AreaRead {
    pub leader: LeaderRecord,
    pub our_dblock: Dblock,
    pub max_mbal: u64,
}

async fn lease_read_one(token: &Token, disk: &SyncDisk) -> Result<AreaRead> {
    let buf = read_iobuf(
        disk,
        0,
        token.align_size as usize,
        token.sector_size,
        token.io_timeout(),
    )
    .await?;

    let (leader, computed) = LeaderRecord::decode_from(&buf[..])?;
    let ss = token.sector_size as usize;
    let our_off = dblock_sector(token.host_id) as usize * ss;
    let (our_dblock, _) = Dblock::decode_from(&buf[our_off..our_off + ss])?;
    verify_leader(token, &leader, computed)?;

    let mut max_mbal = 0;
    for q in 1..=leader.num_hosts {
        let off = dblock_sector(q) as usize * ss;
        let (bk, bk_computed) = Dblock::decode_from(&buf[off..off + ss])?;
        bk.verify_checksum(bk_computed)?;
        if bk.mbal > max_mbal {
            max_mbal = bk.mbal;
        }
    }
    Ok(AreaRead {
        leader,
        our_dblock,
        max_mbal,
    })
}

/// One aligned read of the entire lease area per disk, reduced to a
/// majority-consistent view.
pub(crate) async fn lease_read(token: &Token) -> Result<AreaRead> {
    if token.num_disks() == 1 {
        let area = lease_read_one(token, &token.disks[0]).await?;
        debug!(
            resource = %token.resource_name,
            lver = area.leader.lver,
            owner_id = area.leader.owner_id,
            owner_generation = area.leader.owner_generation,
            timestamp = area.leader.timestamp,
            max_mbal = area.max_mbal,
            our_mbal = area.our_dblock.mbal,
            our_lver = area.our_dblock.lver,
            "lease area read"
        );
        return Ok(area);
    }

    let mut views: Vec<AreaRead> = Vec::new();
    let mut reads = 0;
    for disk in &token.disks {
        match lease_read_one(token, disk).await {
            Ok(view) => {
                reads += 1;
                views.push(view);
            }
            Err(err) => {
                warn!(resource = %token.resource_name, disk = %disk.path().display(), %err, "lease area read failed");
            }
        }
    }
    if !majority(token.num_disks(), reads) {
        return Err(Error::DblockRead);
    }

    let leaders: Vec<LeaderRecord> = views.iter().map(|v| v.leader).collect();
    let leader = majority_leader(token, &leaders).ok_or(Error::LeaderDiff)?;
    let best = views
        .iter()
        .max_by_key(|v| v.max_mbal)
        .expect("at least one view");
    Ok(AreaRead {
        leader,
        our_dblock: best.our_dblock,
        max_mbal: best.max_mbal,
    })
}
