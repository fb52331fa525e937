//! Resource lease area initialization.

use sector_io::{write_iobuf, AlignedBuf};
use tracing::info;

use ondisk::leader::{
    LEASE_FREE, PAXOS_LEADER_CLEAR, PAXOS_LEADER_MAGIC, PAXOS_LEADER_VERSION,
};
use ondisk::request::{REQUEST_MAGIC, REQUEST_VERSION};
use ondisk::{name_bytes, LeaderRecord, RequestRecord, DEFAULT_MAX_HOSTS};

use crate::errors::Result;
use crate::token::Token;

/// Write a fresh lease area: a FREE leader, an empty request record, and
/// zeroed dblocks. `write_clear` stamps the cleared magic instead, marking
/// an area that was deliberately wiped.
pub async fn init(token: &Token, num_hosts: u64, write_clear: bool) -> Result<()> {
    let max_hosts = DEFAULT_MAX_HOSTS;
    let num_hosts = if num_hosts == 0 || num_hosts > max_hosts {
        max_hosts
    } else {
        num_hosts
    };
    let sector_size = token.sector_size as usize;

    let mut leader = LeaderRecord {
        magic: if write_clear {
            PAXOS_LEADER_CLEAR
        } else {
            PAXOS_LEADER_MAGIC
        },
        version: PAXOS_LEADER_VERSION,
        sector_size: token.sector_size,
        num_hosts,
        max_hosts,
        space_name: name_bytes(&token.space_name),
        resource_name: name_bytes(&token.resource_name),
        timestamp: LEASE_FREE,
        io_timeout: token.timeouts.io_timeout_seconds(),
        write_timestamp: if write_clear {
            delta_lease::monotime()
        } else {
            0
        },
        ..Default::default()
    };
    let request = RequestRecord {
        magic: REQUEST_MAGIC,
        version: REQUEST_VERSION,
        ..Default::default()
    };

    // init must land everywhere, not just a majority
    for disk in &token.disks {
        let mut area = AlignedBuf::zeroed(token.align_size as usize);
        leader.encode_into(&mut area[..sector_size])?;
        request.encode_into(&mut area[sector_size..2 * sector_size])?;
        write_iobuf(disk, 0, area, token.sector_size, token.io_timeout()).await?;
    }

    info!(
        space = %token.space_name,
        resource = %token.resource_name,
        num_hosts,
        write_clear,
        "resource lease area initialized"
    );
    Ok(())
}
