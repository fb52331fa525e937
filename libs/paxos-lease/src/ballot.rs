//! The two-phase Disk-Paxos ballot.
//!
//! Phase 1: write dblock[p] = {mbal, lver}, then read every other host's
//! dblock; abort on any mbal above ours (or any lver above the one we are
//! contending for). Phase 2: adopt the inp of the highest-bal non-empty
//! dblock seen (or propose ourselves), write dblock[p] with bal = mbal,
//! reread with the same abort rules. Completing phase 2 commits the value.
//!
//! It is legal (and occasionally observed) for a host to adopt and commit
//! a value that another host originally proposed, including our own inp
//! coming back to us via a third dblock.

use std::collections::HashMap;

use sector_io::read_iobuf;
use tracing::{debug, warn};

use ondisk::{dblock_sector, Dblock, ModeBlock};

use crate::disk::{majority, write_dblock_all};
use crate::errors::{Error, Result};
use crate::token::Token;

/// A successful ballot: the committed dblock plus every shared-mode claim
/// seen while reading the area.
#[derive(Debug, Clone)]
pub(crate) struct BallotOutcome {
    pub dblock: Dblock,
    pub shared: Vec<(u64, u64)>,
}

#[derive(Clone, Copy)]
enum Phase {
    One,
    Two,
}

pub(crate) async fn run_ballot(
    token: &mut Token,
    num_hosts: u64,
    next_lver: u64,
    our_mbal: u64,
) -> Result<BallotOutcome> {
    let sector_count = (num_hosts + 2).next_power_of_two();
    let iobuf_len = sector_count as usize * token.sector_size as usize;
    let mut shared: HashMap<u64, u64> = HashMap::new();

    // phase 1
    debug!(
        resource = %token.resource_name,
        lver = next_lver,
        mbal = our_mbal,
        "ballot phase1 write"
    );
    let mut dblock = Dblock {
        mbal: our_mbal,
        lver: next_lver,
        ..Default::default()
    };
    write_dblock_all(token, &mut dblock).await?;

    let bk_max = match read_phase(
        token,
        iobuf_len,
        num_hosts,
        &dblock,
        Phase::One,
        &mut shared,
    )
    .await
    {
        Ok(bk_max) => bk_max,
        Err(err) => return Err(err),
    };

    // choose the value to commit: the highest-bal proposal seen, else our
    // own input
    if bk_max.inp != 0 {
        dblock.inp = bk_max.inp;
        dblock.inp2 = bk_max.inp2;
        dblock.inp3 = bk_max.inp3;
        debug!(
            resource = %token.resource_name,
            lver = next_lver,
            inp = bk_max.inp,
            inp2 = bk_max.inp2,
            bal = bk_max.bal,
            "ballot adopting published proposal"
        );
    } else {
        dblock.inp = token.host_id;
        dblock.inp2 = token.host_generation;
        dblock.inp3 = delta_lease::monotime();
    }
    dblock.bal = dblock.mbal;

    // phase 2
    debug!(
        resource = %token.resource_name,
        lver = next_lver,
        bal = dblock.bal,
        inp = dblock.inp,
        inp2 = dblock.inp2,
        inp3 = dblock.inp3,
        "ballot phase2 write"
    );
    let phase2_result: Result<()> = async {
        write_dblock_all(token, &mut dblock).await?;
        read_phase(token, iobuf_len, num_hosts, &dblock, Phase::Two, &mut shared).await?;
        Ok(())
    }
    .await;

    if let Err(err) = phase2_result {
        // Our phase-2 proposal is on disk: another host can adopt and
        // commit it even though we are failing. Flag the token so release
        // rectifies the leader if that happens.
        if matches!(err, Error::DblockRead | Error::DblockWrite)
            || matches!(&err, Error::Io(e) if e.is_timeout())
        {
            token.retract = true;
            warn!(
                resource = %token.resource_name,
                lver = next_lver,
                %err,
                "ballot failed after phase2 write, retract set"
            );
        }
        return Err(err);
    }

    Ok(BallotOutcome {
        dblock,
        shared: shared.into_iter().collect(),
    })
}

/// Read every disk's dblock sectors once and apply the ballot abort rules
/// against `ours`. Returns the highest-bal non-empty dblock observed (only
/// meaningful for phase 1).
async fn read_phase(
    token: &Token,
    iobuf_len: usize,
    num_hosts: u64,
    ours: &Dblock,
    phase: Phase,
    shared: &mut HashMap<u64, u64>,
) -> Result<Dblock> {
    let ss = token.sector_size as usize;
    let mut bk_max = Dblock::default();
    let mut reads = 0;
    let mut timeout: Option<Error> = None;

    for disk in &token.disks {
        let buf = match read_iobuf(disk, 0, iobuf_len, token.sector_size, token.io_timeout()).await
        {
            Ok(buf) => buf,
            Err(err) => {
                warn!(resource = %token.resource_name, disk = %disk.path().display(), %err, "ballot read failed");
                if err.is_timeout() {
                    timeout = Some(err.into());
                }
                continue;
            }
        };
        reads += 1;

        for q in 1..=num_hosts {
            let off = dblock_sector(q) as usize * ss;
            let sector = &buf[off..off + ss];
            let (bk, computed) = Dblock::decode_from(sector)?;

            if let Ok(mb) = ModeBlock::decode_from(sector) {
                if mb.is_shared() {
                    shared.insert(q, mb.generation);
                }
            }

            if let Err(err) = bk.verify_checksum(computed) {
                warn!(resource = %token.resource_name, host_id = q, %err, "bad dblock skipped in ballot");
                continue;
            }

            if bk.lver < ours.lver {
                continue;
            }
            if bk.lver > ours.lver {
                warn!(
                    resource = %token.resource_name,
                    lver = ours.lver,
                    host_id = q,
                    seen = bk.lver,
                    phase = phase_name(phase),
                    "ballot aborted by larger lver"
                );
                return Err(Error::DblockLver {
                    host_id: q,
                    seen: bk.lver,
                });
            }
            if bk.mbal > ours.mbal {
                debug!(
                    resource = %token.resource_name,
                    lver = ours.lver,
                    host_id = q,
                    our_mbal = ours.mbal,
                    seen = bk.mbal,
                    phase = phase_name(phase),
                    "ballot aborted by larger mbal"
                );
                return Err(Error::DblockMbal {
                    host_id: q,
                    seen: bk.mbal,
                });
            }

            if matches!(phase, Phase::One) {
                if bk.inp == 0 {
                    continue;
                }
                if bk.bal == 0 {
                    warn!(resource = %token.resource_name, host_id = q, inp = bk.inp, "dblock with inp but zero bal");
                    continue;
                }
                if bk.bal > bk_max.bal {
                    bk_max = bk;
                }
            }
        }
    }

    if !majority(token.num_disks(), reads) {
        return Err(timeout.unwrap_or(Error::DblockRead));
    }
    Ok(bk_max)
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::One => "1",
        Phase::Two => "2",
    }
}
