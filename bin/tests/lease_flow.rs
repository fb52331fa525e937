//! Two hosts sharing file-backed lease areas: join, contend, seize.

use std::sync::Arc;

use delta_lease::Timeouts;
use moor_core::lockspaces::LockspaceRegistry;
use paxos_lease::{AcquireOptions, Token};
use sector_io::SyncDisk;
use tokio_util::sync::CancellationToken;
use wdmd_client::NullWatchdog;

const SPACE: &str = "vg01";
const RESOURCE: &str = "lv-data";

fn scratch_area() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(ondisk::ALIGN_SIZE_1M).unwrap();
    file
}

fn open(file: &tempfile::NamedTempFile) -> SyncDisk {
    SyncDisk::open_buffered(file.path(), 0).unwrap()
}

fn fast_timeouts() -> Timeouts {
    Timeouts::new(2).with_host_dead_override(0)
}

fn resource_token(file: &tempfile::NamedTempFile, host_id: u64, generation: u64) -> Token {
    Token::new(
        SPACE,
        RESOURCE,
        vec![open(file)],
        512,
        host_id,
        generation,
        fast_timeouts(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_two_host_lease_flow() {
    let lockspace_file = scratch_area();
    let resource_file = scratch_area();

    LockspaceRegistry::init_area(open(&lockspace_file), SPACE, 16, &fast_timeouts())
        .await
        .unwrap();
    {
        let token = resource_token(&resource_file, 1, 1);
        paxos_lease::init(&token, 8, false).await.unwrap();
    }

    // both hosts join the lockspace, each with its own daemon-side registry
    let registry1 = LockspaceRegistry::new();
    let ls1 = registry1
        .add(SPACE, 1, open(&lockspace_file), 16, fast_timeouts(), Arc::new(NullWatchdog))
        .await
        .unwrap();
    let registry2 = LockspaceRegistry::new();
    let ls2 = registry2
        .add(SPACE, 2, open(&lockspace_file), 16, fast_timeouts(), Arc::new(NullWatchdog))
        .await
        .unwrap();
    assert!(ls1.renewal_current());
    assert!(ls2.renewal_current());

    // host 1 takes the resource
    let cancel = CancellationToken::new();
    let mut token1 = resource_token(&resource_file, 1, ls1.generation());
    let (leader1, _) = paxos_lease::acquire(&mut token1, &registry1, AcquireOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(leader1.lver, 1);
    assert_eq!(leader1.owner_id, 1);

    // host 2 cannot seize while host 1 keeps renewing; give its token a
    // realistic dead window so liveness decides, not the clock
    let mut token2 = resource_token(&resource_file, 2, ls2.generation());
    token2.timeouts = Timeouts::new(2).with_host_dead_override(30);
    let err = paxos_lease::acquire(&mut token2, &registry2, AcquireOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, paxos_lease::Error::AcquireIdLive { owner_id: 1, .. }));

    // host 1 leaves the lockspace without releasing the resource; its
    // freed delta lease is proof enough for a seizure
    registry1.remove(SPACE).await.unwrap();

    let mut token2 = resource_token(&resource_file, 2, ls2.generation());
    let (leader2, _) = paxos_lease::acquire(&mut token2, &registry2, AcquireOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(leader2.lver, 2);
    assert_eq!(leader2.owner_id, 2);
    assert_eq!(leader2.write_id, 2);

    // orderly release frees the leader for the next taker
    let freed = paxos_lease::release(&mut token2, Some(&leader2), None)
        .await
        .unwrap();
    assert!(freed.is_free());

    registry2.remove(SPACE).await.unwrap();
}

#[tokio::test]
async fn test_generation_bump_on_rejoin() {
    let lockspace_file = scratch_area();
    LockspaceRegistry::init_area(open(&lockspace_file), SPACE, 16, &fast_timeouts())
        .await
        .unwrap();

    let registry = LockspaceRegistry::new();
    let ls = registry
        .add(SPACE, 3, open(&lockspace_file), 16, fast_timeouts(), Arc::new(NullWatchdog))
        .await
        .unwrap();
    assert_eq!(ls.generation(), 1);
    registry.remove(SPACE).await.unwrap();

    let ls = registry
        .add(SPACE, 3, open(&lockspace_file), 16, fast_timeouts(), Arc::new(NullWatchdog))
        .await
        .unwrap();
    assert_eq!(ls.generation(), 2);
    registry.remove(SPACE).await.unwrap();
}
