//! Drive a whole daemon over its command socket.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use moor_core::config::{cli, trace::LogRing};
use moor_core::lockspaces::LockspaceRegistry;
use moor_core::protocol::{
    AcquireRequest, Command, Header, LockspaceSpec, ReleaseRequest, ResourceSpec, StatusReply,
    HEADER_LEN,
};
use moor_core::{Daemon, Server};

const SPACE: &str = "vg01";
const RESOURCE: &str = "lv-data";

struct TestRig {
    _dir: tempfile::TempDir,
    socket_path: PathBuf,
    lockspace_path: PathBuf,
    resource_path: PathBuf,
    daemon: Arc<Daemon>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_rig() -> TestRig {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("moord.sock");
    let lockspace_path = dir.path().join("lockspace.img");
    let resource_path = dir.path().join("resource.img");

    let mut config = cli::Config::defaults();
    config.socket_path = socket_path.clone();
    config.io_timeout = 2;
    config.use_watchdog = false;
    config.direct_io = false;
    config.host_dead_override = Some(0);

    for path in [&lockspace_path, &resource_path] {
        let file = std::fs::File::create(path).unwrap();
        file.set_len(ondisk::ALIGN_SIZE_1M).unwrap();
    }
    let timeouts = config.timeouts();
    let disk = sector_io::SyncDisk::open_buffered(&lockspace_path, 0).unwrap();
    LockspaceRegistry::init_area(disk, SPACE, 16, &timeouts)
        .await
        .unwrap();
    let disk = sector_io::SyncDisk::open_buffered(&resource_path, 0).unwrap();
    let token = paxos_lease::Token::new(
        SPACE,
        RESOURCE,
        vec![disk],
        512,
        1,
        0,
        timeouts,
    )
    .unwrap();
    paxos_lease::init(&token, 8, false).await.unwrap();

    let daemon = Daemon::new(config, LogRing::default());
    let listener = UnixListener::bind(&socket_path).unwrap();
    let cancel = daemon.cancel.clone();
    let server_daemon = Arc::clone(&daemon);
    let server = tokio::spawn(async move {
        Server::new(server_daemon)
            .listen(listener, async move {
                cancel.cancelled().await;
                Ok(())
            })
            .await
    });

    TestRig {
        _dir: dir,
        socket_path,
        lockspace_path,
        resource_path,
        daemon,
        server,
    }
}

async fn call(
    stream: &mut UnixStream,
    cmd: Command,
    seq: u32,
    payload: &[u8],
) -> (Header, Vec<u8>) {
    let header = Header::request(cmd, seq, payload.len() as u32);
    stream.write_all(&header.encode()).await.unwrap();
    if !payload.is_empty() {
        stream.write_all(payload).await.unwrap();
    }

    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).await.unwrap();
    let reply = Header::decode(&raw);
    let mut body = vec![0u8; reply.length as usize];
    if reply.length > 0 {
        stream.read_exact(&mut body).await.unwrap();
    }
    assert_eq!(reply.seq, seq);
    (reply, body)
}

#[tokio::test]
async fn test_daemon_command_round_trip() {
    let rig = start_rig().await;
    let mut conn = UnixStream::connect(&rig.socket_path).await.unwrap();

    // REGISTER hands back a client id
    let (reply, _) = call(&mut conn, Command::Register, 1, &[]).await;
    assert_eq!(reply.data, 0);
    assert!(reply.data2 > 0);

    // SET_HOST_ID joins the lockspace (instant with the test overrides)
    let spec = LockspaceSpec {
        name: SPACE.into(),
        host_id: 1,
        path: rig.lockspace_path.display().to_string(),
        offset: 0,
        io_timeout_seconds: None,
    };
    let (reply, _) = call(
        &mut conn,
        Command::SetHostId,
        2,
        &serde_json::to_vec(&spec).unwrap(),
    )
    .await;
    assert_eq!(reply.data, 0);

    // ACQUIRE one resource
    let req = AcquireRequest {
        resources: vec![ResourceSpec {
            lockspace: SPACE.into(),
            name: RESOURCE.into(),
            path: rig.resource_path.display().to_string(),
            offset: 0,
        }],
        shared: false,
        acquire_lver: 0,
    };
    let (reply, _) = call(
        &mut conn,
        Command::Acquire,
        3,
        &serde_json::to_vec(&req).unwrap(),
    )
    .await;
    assert_eq!(reply.data, 0, "acquire failed: {}", reply.data);
    assert_eq!(reply.data2, 1);

    // STATUS reflects the held token
    let (reply, body) = call(&mut conn, Command::Status, 4, &[]).await;
    assert_eq!(reply.data, 0);
    let status: StatusReply = serde_json::from_slice(&body).unwrap();
    assert_eq!(status.lockspaces.len(), 1);
    assert_eq!(status.lockspaces[0].name, SPACE);
    assert!(status.lockspaces[0].renewal_current);
    assert_eq!(status.tokens.len(), 1);
    assert_eq!(status.tokens[0].resource, RESOURCE);
    assert_eq!(status.tokens[0].state, "held");
    assert_eq!(status.tokens[0].lver, 1);

    // duplicate ACQUIRE of the same resource is refused
    let (reply, _) = call(
        &mut conn,
        Command::Acquire,
        5,
        &serde_json::to_vec(&req).unwrap(),
    )
    .await;
    assert!(reply.data < 0);

    // RELEASE everything
    let rel = ReleaseRequest {
        resources: vec![],
        all: true,
        rename: None,
        save_for_reacquire: false,
    };
    let (reply, _) = call(
        &mut conn,
        Command::Release,
        6,
        &serde_json::to_vec(&rel).unwrap(),
    )
    .await;
    assert_eq!(reply.data, 0);

    let (_, body) = call(&mut conn, Command::Status, 7, &[]).await;
    let status: StatusReply = serde_json::from_slice(&body).unwrap();
    assert!(status.tokens.is_empty());

    // drop the registered connection before asking for shutdown so the
    // daemon is not left supervising the test process itself, and wait
    // until it has seen the close
    drop(conn);
    for _ in 0..100 {
        if rig.daemon.clients.pids().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(rig.daemon.clients.pids().is_empty());

    let mut admin = UnixStream::connect(&rig.socket_path).await.unwrap();
    let (reply, _) = call(&mut admin, Command::Shutdown, 8, &[]).await;
    assert_eq!(reply.data, 0);

    rig.server.await.unwrap().unwrap();
    assert!(rig.daemon.lockspaces.get(SPACE).is_none());
}

#[tokio::test]
async fn test_unregistered_client_cannot_acquire() {
    let rig = start_rig().await;
    let mut conn = UnixStream::connect(&rig.socket_path).await.unwrap();

    let req = AcquireRequest {
        resources: vec![],
        shared: false,
        acquire_lver: 0,
    };
    let (reply, _) = call(
        &mut conn,
        Command::Acquire,
        1,
        &serde_json::to_vec(&req).unwrap(),
    )
    .await;
    assert!(reply.data < 0);

    drop(conn);
    rig.daemon.cancel.cancel();
    rig.server.await.unwrap().unwrap();
}
