//! The shared-mode overlay. A shared claim is a mode block colocated with
//! the host's dblock; it never runs a ballot. Exclusive ballots read the
//! mode blocks as a side effect and refuse to commit over a live claim.

use sector_io::{read_iobuf, read_sectors, write_iobuf};
use tracing::{debug, info};

use ondisk::dblock::MODE_BLOCK_SHARED;
use ondisk::{dblock_sector, LeaderRecord, ModeBlock};

use crate::disk::leader_read;
use crate::errors::{Error, Result};
use crate::token::Token;

/// Rewrite only the mode-block region of our dblock sector.
async fn write_our_mode_block(token: &Token, mb: ModeBlock) -> Result<()> {
    for disk in &token.disks {
        let mut buf = read_sectors(
            disk,
            token.sector_size,
            dblock_sector(token.host_id),
            1,
            token.io_timeout(),
        )
        .await?;
        mb.encode_into(&mut buf)?;
        write_iobuf(
            disk,
            dblock_sector(token.host_id) * u64::from(token.sector_size),
            buf,
            token.sector_size,
            token.io_timeout(),
        )
        .await?;
    }
    Ok(())
}

/// Publish our SHARED claim at our current host generation.
pub async fn set_shared(token: &Token) -> Result<()> {
    write_our_mode_block(
        token,
        ModeBlock {
            flags: MODE_BLOCK_SHARED,
            generation: token.host_generation,
        },
    )
    .await?;
    debug!(
        resource = %token.resource_name,
        generation = token.host_generation,
        "shared claim set"
    );
    Ok(())
}

/// Withdraw our SHARED claim.
pub async fn clear_shared(token: &Token) -> Result<()> {
    write_our_mode_block(token, ModeBlock::default()).await?;
    debug!(resource = %token.resource_name, "shared claim cleared");
    Ok(())
}

/// Every non-empty mode block in the area, as `(host_id, mode_block)`.
pub async fn read_mode_blocks(token: &Token) -> Result<Vec<(u64, ModeBlock)>> {
    let buf = read_iobuf(
        &token.disks[0],
        0,
        token.align_size as usize,
        token.sector_size,
        token.io_timeout(),
    )
    .await?;
    let (leader, computed) = LeaderRecord::decode_from(&buf[..])?;
    crate::disk::verify_leader(token, &leader, computed)?;

    let ss = token.sector_size as usize;
    let mut out = Vec::new();
    for q in 1..=leader.num_hosts {
        let off = dblock_sector(q) as usize * ss;
        let sector = &buf[off..off + ss];
        let mb = ModeBlock::decode_from(sector)?;
        if mb.flags != 0 || mb.generation != 0 {
            out.push((q, mb));
        }
    }
    Ok(out)
}

/// Acquire the resource in shared mode. Legal only while the leader is
/// FREE or its owner itself holds the lease in shared mode; there is no
/// ballot, only the mode-block write plus a reread to catch an exclusive
/// commit racing with the claim.
pub async fn acquire_shared(token: &Token) -> Result<()> {
    let leader = leader_read(token).await?;
    if !leader.is_free() && !owner_is_shared(token, &leader).await? {
        return Err(Error::AcquireOwned {
            owner_id: leader.owner_id,
            owner_generation: leader.owner_generation,
        });
    }

    set_shared(token).await?;

    let after = leader_read(token).await?;
    if !after.is_free()
        && after.owner_id != token.host_id
        && !owner_is_shared(token, &after).await?
    {
        // an exclusive owner committed while we were claiming; back out
        clear_shared(token).await?;
        return Err(Error::AcquireOwned {
            owner_id: after.owner_id,
            owner_generation: after.owner_generation,
        });
    }

    info!(
        resource = %token.resource_name,
        generation = token.host_generation,
        "shared lease acquired"
    );
    Ok(())
}

async fn owner_is_shared(token: &Token, leader: &LeaderRecord) -> Result<bool> {
    let modes = read_mode_blocks(token).await?;
    Ok(modes.iter().any(|(host_id, mb)| {
        *host_id == leader.owner_id && mb.is_shared() && mb.generation == leader.owner_generation
    }))
}
