//! The release path, including the rectification required after an
//! acquire that failed with its phase-2 proposal still adoptable.

use tracing::{debug, info, warn};

use ondisk::dblock::DBLOCK_FLAG_RELEASED;
use ondisk::leader::{LEADER_FLAG_SHORT_HOLD, LEASE_FREE};
use ondisk::{name_bytes, Dblock, LeaderRecord};

use crate::disk::{leader_read, read_dblock, write_dblock_all, write_new_leader};
use crate::errors::{Error, Result};
use crate::token::Token;

/// Zero our dblock on every disk. With `preserve_shared` set the mode
/// block survives the erase.
pub async fn erase_dblock(token: &Token) -> Result<()> {
    let mut zeroed = Dblock::default();
    write_dblock_all(token, &mut zeroed).await
}

/// Set RELEASED in our dblock without touching the rest of it.
async fn write_released_dblock(token: &Token) -> Result<()> {
    let (mut db, _) = read_dblock(token, &token.disks[0], token.host_id).await?;
    db.flags |= DBLOCK_FLAG_RELEASED;
    write_dblock_all(token, &mut db).await
}

/// Release the lease last committed as `last`. `last = None` releases
/// defensively: whatever the disk says now is taken as the expected state,
/// which is how a retracted acquire makes sure it does not remain owner.
///
/// When another host physically wrote the leader that names us, we only
/// mark our dblock RELEASED; zeroing the leader could clobber a newer
/// commit racing with us. Peers treat the RELEASED dblock as authoritative.
pub async fn release(
    token: &mut Token,
    last: Option<&LeaderRecord>,
    rename: Option<&str>,
) -> Result<LeaderRecord> {
    let leader = leader_read(token).await?;
    let last = last.copied().unwrap_or(leader);

    if leader.write_id != token.host_id {
        info!(
            resource = %token.resource_name,
            lver = leader.lver,
            write_id = leader.write_id,
            "foreign writer, marking dblock released only"
        );
        write_released_dblock(token).await?;
        token.retract = false;
        return Ok(leader);
    }

    let verdict = if leader.lver != last.lver {
        Err(Error::ReleaseLver {
            expected: last.lver,
            found: leader.lver,
        })
    } else if leader.timestamp == LEASE_FREE {
        Err(Error::ReleaseOwner {
            owner_id: leader.owner_id,
            owner_generation: leader.owner_generation,
            timestamp: leader.timestamp,
        })
    } else if leader.owner_id != token.host_id
        || leader.owner_generation != token.host_generation
    {
        Err(Error::ReleaseOwner {
            owner_id: leader.owner_id,
            owner_generation: leader.owner_generation,
            timestamp: leader.timestamp,
        })
    } else {
        Ok(())
    };

    if let Err(err) = verdict {
        warn!(resource = %token.resource_name, %err, "release diagnostics, clearing dblock anyway");
        erase_dblock(token).await?;
        token.retract = false;
        return Err(err);
    }

    let mut freed = leader;
    if let Some(new_name) = rename {
        // the rename rides the same write as the FREE transition
        freed.resource_name = name_bytes(new_name);
    }
    freed.timestamp = LEASE_FREE;
    freed.write_id = token.host_id;
    freed.write_generation = token.host_generation;
    freed.write_timestamp = delta_lease::monotime();
    freed.flags &= !LEADER_FLAG_SHORT_HOLD;

    write_new_leader(token, &mut freed).await?;
    erase_dblock(token).await?;
    token.retract = false;

    debug!(resource = %token.resource_name, lver = freed.lver, "lease released");
    Ok(freed)
}
