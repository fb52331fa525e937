//! Delta-lease disk operations: one verified sector per host_id.

use sector_io::{read_sectors, write_iobuf, write_sector, AlignedBuf, SyncDisk};
use tracing::{debug, info, warn};

use ondisk::leader::{
    DELTA_LEASE_MAGIC, DELTA_LEASE_VERSION, DELTA_LEASE_VERSION_MAJOR, LEASE_FREE,
};
use ondisk::{align_size_for_sector, delta_sector, host_id_name, name_bytes, LeaderRecord};

use crate::clock::monotime;
use crate::errors::{Error, Result};
use crate::timeouts::Timeouts;

/// Placement of one lockspace's delta-lease area.
#[derive(Debug, Clone)]
pub struct DeltaDisk {
    pub disk: SyncDisk,
    pub sector_size: u32,
    pub space_name: String,
}

impl DeltaDisk {
    pub fn new(disk: SyncDisk, sector_size: u32, space_name: impl Into<String>) -> Self {
        DeltaDisk {
            disk,
            sector_size,
            space_name: space_name.into(),
        }
    }
}

fn verify(dd: &DeltaDisk, lr: &LeaderRecord, computed: u32, host_id: u64) -> Result<()> {
    if lr.magic != DELTA_LEASE_MAGIC {
        return Err(Error::Magic { magic: lr.magic });
    }
    if lr.version & 0xffff_0000 != DELTA_LEASE_VERSION_MAJOR {
        return Err(Error::Version {
            version: lr.version,
        });
    }
    if lr.space_name != name_bytes(&dd.space_name) {
        return Err(Error::Lockspace {
            found: lr.space_name_str(),
            expected: dd.space_name.clone(),
        });
    }
    let expected = host_id_name(host_id);
    if lr.resource_name != expected {
        return Err(Error::HostIdName {
            found: lr.resource_name_str(),
            expected: ondisk::name_str(&expected),
        });
    }
    lr.verify_checksum(computed)?;
    Ok(())
}

/// Read and fully verify one host's delta-lease sector.
pub async fn leader_read(dd: &DeltaDisk, timeouts: &Timeouts, host_id: u64) -> Result<LeaderRecord> {
    let buf = read_sectors(
        &dd.disk,
        dd.sector_size,
        delta_sector(host_id),
        1,
        timeouts.io_timeout(),
    )
    .await?;
    let (lr, computed) = LeaderRecord::decode_from(&buf)?;
    verify(dd, &lr, computed, host_id)?;
    Ok(lr)
}

async fn leader_write(dd: &DeltaDisk, timeouts: &Timeouts, lr: &mut LeaderRecord) -> Result<()> {
    let mut sector = vec![0u8; dd.sector_size as usize];
    lr.encode_into(&mut sector)?;
    write_sector(
        &dd.disk,
        dd.sector_size,
        delta_sector(lr.owner_id),
        &sector,
        timeouts.io_timeout(),
    )
    .await?;
    Ok(())
}

/// Acquire `host_id` in this lockspace.
///
/// Both waits cover a full host-dead interval so that a live-but-slow
/// previous holder has renewed (and a racing acquirer has shown itself)
/// before we trust the sector: read, wait, reread-and-compare, write
/// ourselves with a bumped generation, wait, reread-and-verify our write.
pub async fn acquire(dd: &DeltaDisk, timeouts: &Timeouts, host_id: u64) -> Result<LeaderRecord> {
    let lr = leader_read(dd, timeouts, host_id).await?;
    let t0 = lr.timestamp;
    let wait = timeouts.host_dead_seconds(lr.io_timeout);

    debug!(
        space = %dd.space_name,
        host_id,
        owner_id = lr.owner_id,
        owner_generation = lr.owner_generation,
        timestamp = t0,
        wait,
        "host_id acquire begin"
    );
    tokio::time::sleep(std::time::Duration::from_secs(wait)).await;

    let lr = leader_read(dd, timeouts, host_id).await?;
    if lr.timestamp != t0 {
        return Err(Error::Owned {
            host_id,
            owner_id: lr.owner_id,
            owner_generation: lr.owner_generation,
        });
    }

    let now = monotime();
    let mut ours = LeaderRecord {
        magic: DELTA_LEASE_MAGIC,
        version: DELTA_LEASE_VERSION,
        sector_size: dd.sector_size,
        owner_id: host_id,
        owner_generation: lr.owner_generation + 1,
        space_name: name_bytes(&dd.space_name),
        resource_name: host_id_name(host_id),
        timestamp: now,
        io_timeout: timeouts.io_timeout_seconds(),
        write_id: host_id,
        write_generation: lr.owner_generation + 1,
        write_timestamp: now,
        ..Default::default()
    };
    leader_write(dd, timeouts, &mut ours).await?;

    tokio::time::sleep(std::time::Duration::from_secs(wait)).await;

    let check = leader_read(dd, timeouts, host_id).await?;
    if check.owner_id != ours.owner_id
        || check.owner_generation != ours.owner_generation
        || check.timestamp != ours.timestamp
        || check.write_id != ours.write_id
    {
        return Err(Error::Owned {
            host_id,
            owner_id: check.owner_id,
            owner_generation: check.owner_generation,
        });
    }

    info!(
        space = %dd.space_name,
        host_id,
        generation = ours.owner_generation,
        "host_id acquired"
    );
    Ok(ours)
}

/// Renew our delta lease: verify the sector still carries our last write,
/// then stamp a fresh timestamp.
pub async fn renew(dd: &DeltaDisk, timeouts: &Timeouts, prev: &LeaderRecord) -> Result<LeaderRecord> {
    let lr = leader_read(dd, timeouts, prev.owner_id).await?;
    if lr.owner_id != prev.owner_id
        || lr.owner_generation != prev.owner_generation
        || lr.timestamp != prev.timestamp
    {
        return Err(Error::RenewalOwner {
            owner_id: lr.owner_id,
            owner_generation: lr.owner_generation,
            timestamp: lr.timestamp,
        });
    }

    let now = monotime();
    let mut next = lr;
    next.timestamp = now;
    next.io_timeout = timeouts.io_timeout_seconds();
    next.write_timestamp = now;
    leader_write(dd, timeouts, &mut next).await?;
    Ok(next)
}

/// Release our delta lease: write `timestamp = FREE` with owner fields
/// unchanged so the generation survives for the next acquirer to bump.
pub async fn release(dd: &DeltaDisk, timeouts: &Timeouts, prev: &LeaderRecord) -> Result<LeaderRecord> {
    let mut freed = *prev;
    freed.timestamp = LEASE_FREE;
    freed.write_timestamp = monotime();
    leader_write(dd, timeouts, &mut freed).await?;
    info!(space = %dd.space_name, host_id = prev.owner_id, "host_id released");
    Ok(freed)
}

/// Initialize a lockspace's delta-lease area: one FREE record per host_id,
/// generation zero, ready for first acquire.
pub async fn init(dd: &DeltaDisk, timeouts: &Timeouts, max_hosts: u64) -> Result<()> {
    let align_size = align_size_for_sector(dd.sector_size)
        .ok_or(sector_io::Error::SectorSize(dd.sector_size))?;
    let sector_size = dd.sector_size as usize;
    let mut area = AlignedBuf::zeroed(align_size as usize);

    for i in 0..max_hosts {
        let host_id = i + 1;
        let mut lr = LeaderRecord {
            magic: DELTA_LEASE_MAGIC,
            version: DELTA_LEASE_VERSION,
            sector_size: dd.sector_size,
            owner_id: host_id,
            space_name: name_bytes(&dd.space_name),
            resource_name: host_id_name(host_id),
            timestamp: LEASE_FREE,
            ..Default::default()
        };
        let start = i as usize * sector_size;
        lr.encode_into(&mut area[start..start + sector_size])?;
    }

    write_iobuf(&dd.disk, 0, area, dd.sector_size, timeouts.io_timeout()).await?;
    info!(space = %dd.space_name, max_hosts, "delta lease area initialized");
    Ok(())
}

/// One pass over the whole delta area. Sectors that fail checksum or
/// verification yield `None`; they are logged but never mark the host
/// live or dead.
pub async fn read_hosts(
    dd: &DeltaDisk,
    timeouts: &Timeouts,
    max_hosts: u64,
) -> Result<Vec<Option<LeaderRecord>>> {
    let buf = read_sectors(&dd.disk, dd.sector_size, 0, max_hosts, timeouts.io_timeout()).await?;
    let sector_size = dd.sector_size as usize;
    let mut out = Vec::with_capacity(max_hosts as usize);
    for i in 0..max_hosts as usize {
        let sector = &buf[i * sector_size..(i + 1) * sector_size];
        let host_id = i as u64 + 1;
        match LeaderRecord::decode_from(sector) {
            Ok((lr, computed)) => match verify(dd, &lr, computed, host_id) {
                Ok(()) => out.push(Some(lr)),
                Err(err) => {
                    warn!(space = %dd.space_name, host_id, %err, "bad delta sector skipped");
                    out.push(None);
                }
            },
            Err(err) => {
                warn!(space = %dd.space_name, host_id, %err, "undecodable delta sector skipped");
                out.push(None);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_timeouts() -> Timeouts {
        Timeouts::new(10).with_host_dead_override(0)
    }

    async fn scratch_space(max_hosts: u64) -> (tempfile::NamedTempFile, DeltaDisk) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(ondisk::ALIGN_SIZE_1M).unwrap();
        let disk = SyncDisk::open_buffered(file.path(), 0).unwrap();
        let dd = DeltaDisk::new(disk, 512, "vg01");
        init(&dd, &test_timeouts(), max_hosts).await.unwrap();
        (file, dd)
    }

    #[tokio::test]
    async fn test_init_then_read() {
        let (_file, dd) = scratch_space(10).await;
        let lr = leader_read(&dd, &test_timeouts(), 3).await.unwrap();
        assert!(lr.is_free());
        assert_eq!(lr.owner_id, 3);
        assert_eq!(lr.owner_generation, 0);
        assert_eq!(lr.resource_name_str(), "hostid 3");
    }

    #[tokio::test]
    async fn test_acquire_bumps_generation() {
        let (_file, dd) = scratch_space(10).await;
        let timeouts = test_timeouts();

        let first = acquire(&dd, &timeouts, 3).await.unwrap();
        assert_eq!(first.owner_generation, 1);
        assert_ne!(first.timestamp, LEASE_FREE);

        let freed = release(&dd, &timeouts, &first).await.unwrap();
        assert!(freed.is_free());

        let second = acquire(&dd, &timeouts, 3).await.unwrap();
        assert_eq!(second.owner_generation, 2);
    }

    #[tokio::test]
    async fn test_renew_advances_timestamp_only() {
        let (_file, dd) = scratch_space(4).await;
        let timeouts = test_timeouts();
        let rec = acquire(&dd, &timeouts, 1).await.unwrap();

        let renewed = renew(&dd, &timeouts, &rec).await.unwrap();
        assert_eq!(renewed.owner_id, rec.owner_id);
        assert_eq!(renewed.owner_generation, rec.owner_generation);
        assert!(renewed.timestamp >= rec.timestamp);

        // a stale in-memory record no longer matches the disk
        let err = renew(&dd, &timeouts, &rec).await;
        match (renewed.timestamp == rec.timestamp, err) {
            // same-second renewals are indistinguishable; the disk accepts
            (true, Ok(_)) => {}
            (false, Err(Error::RenewalOwner { .. })) => {}
            (same, other) => panic!("unexpected renew outcome: same={same} {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_renew_rejects_foreign_owner() {
        let (_file, dd) = scratch_space(4).await;
        let timeouts = test_timeouts();
        let rec = acquire(&dd, &timeouts, 1).await.unwrap();

        // another host seizes the sector out from under us
        let mut thief = rec;
        thief.owner_generation += 1;
        thief.timestamp = monotime() + 1000;
        leader_write(&dd, &timeouts, &mut thief).await.unwrap();

        let err = renew(&dd, &timeouts, &rec).await.unwrap_err();
        assert!(matches!(err, Error::RenewalOwner { .. }));
    }

    #[tokio::test]
    async fn test_acquire_aborts_when_timestamp_moves() {
        let (_file, dd) = scratch_space(4).await;
        // one-second wait windows so a concurrent renewal lands inside them
        let slow = Timeouts::new(10).with_host_dead_override(1);
        let fast = test_timeouts();

        let holder = acquire(&dd, &fast, 2).await.unwrap();

        // the holder keeps renewing; timestamps advance explicitly because
        // the monotonic clock only has one-second granularity
        let dd2 = dd.clone();
        let renewer = tokio::spawn(async move {
            let mut rec = holder;
            for _ in 0..40 {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                rec.timestamp += 10;
                rec.write_timestamp = rec.timestamp;
                let _ = leader_write(&dd2, &fast, &mut rec).await;
            }
        });

        let err = acquire(&dd, &slow, 2).await.unwrap_err();
        assert!(matches!(err, Error::Owned { host_id: 2, .. }));
        renewer.abort();
    }

    #[tokio::test]
    async fn test_read_hosts_skips_corrupt_sector() {
        let (_file, dd) = scratch_space(6).await;
        let timeouts = test_timeouts();
        acquire(&dd, &timeouts, 2).await.unwrap();

        // corrupt host 4's sector
        let garbage = vec![0xa5u8; 512];
        write_sector(&dd.disk, 512, delta_sector(4), &garbage, timeouts.io_timeout())
            .await
            .unwrap();

        let hosts = read_hosts(&dd, &timeouts, 6).await.unwrap();
        assert_eq!(hosts.len(), 6);
        assert!(hosts[1].is_some());
        assert!(hosts[3].is_none());
        assert_eq!(hosts[1].unwrap().owner_generation, 1);
    }

    #[tokio::test]
    async fn test_wrong_lockspace_name_rejected() {
        let (_file, dd) = scratch_space(4).await;
        let other = DeltaDisk::new(dd.disk.clone(), 512, "vg02");
        let err = leader_read(&other, &test_timeouts(), 1).await.unwrap_err();
        assert!(matches!(err, Error::Lockspace { .. }));
    }
}
