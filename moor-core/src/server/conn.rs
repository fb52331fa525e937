//! One client connection: header framing, dispatch, and the death path
//! that gives a dead pid's leases back.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::daemon::Daemon;
use crate::errors::Error;
use crate::ops;
use crate::protocol::{
    AcquireRequest, Command, ForceRequest, Header, LockspaceSpec, LogDumpReply, MigrateRequest,
    ReleaseRequest, SetOwnerRequest, HEADER_LEN,
};
use crate::server::shutdown::Shutdown;

pub(crate) struct Connection {
    stream: UnixStream,
    daemon: Arc<Daemon>,
    client: Option<Arc<Client>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client", &self.client.as_ref().map(|c| c.id))
            .finish()
    }
}

/// What a command handler sends back.
struct Reply {
    data: i32,
    data2: u32,
    payload: Vec<u8>,
}

impl Reply {
    fn ok() -> Reply {
        Reply {
            data: 0,
            data2: 0,
            payload: Vec::new(),
        }
    }

    fn ok_with(data2: u32) -> Reply {
        Reply {
            data: 0,
            data2,
            payload: Vec::new(),
        }
    }

    fn json<T: Serialize>(value: &T) -> Reply {
        Reply {
            data: 0,
            data2: 0,
            payload: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    fn err(err: &Error) -> Reply {
        Reply {
            data: err.wire_code(),
            data2: 0,
            payload: Vec::new(),
        }
    }
}

impl Connection {
    pub(crate) fn new(stream: UnixStream, daemon: Arc<Daemon>) -> Connection {
        Connection {
            stream,
            daemon,
            client: None,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: Shutdown) {
        loop {
            let request = tokio::select! {
                _ = shutdown.recv() => break,
                res = read_request(&mut self.stream) => res,
            };
            let (header, payload) = match request {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(err) => {
                    debug!(?err, "connection read failed");
                    break;
                }
            };

            let reply = self.dispatch(&header, &payload).await;
            let mut reply_header = Header::request(
                header.command().unwrap_or(Command::Status),
                header.seq,
                reply.payload.len() as u32,
            );
            reply_header.cmd = header.cmd;
            reply_header.data = reply.data;
            reply_header.data2 = reply.data2;

            if let Err(err) = self.write_reply(&reply_header, &reply.payload).await {
                debug!(?err, "connection write failed");
                break;
            }
        }
        self.dead().await;
    }

    /// The connection is gone. A registered client's pid is treated as
    /// dead from here: any leases it still holds are released.
    async fn dead(&mut self) {
        if let Some(client) = self.client.take() {
            info!(client = client.id, pid = ?client.pid, "client connection closed");
            ops::client_dead(&self.daemon, client.id).await;
        }
    }

    async fn dispatch(&mut self, header: &Header, payload: &[u8]) -> Reply {
        if let Err(msg) = header.validate() {
            return Reply::err(&Error::BadRequest(msg));
        }
        let Some(cmd) = header.command() else {
            return Reply::err(&Error::BadRequest(format!("unknown cmd {}", header.cmd)));
        };
        debug!(?cmd, seq = header.seq, "client command");

        match cmd {
            Command::Register => {
                let pid = self
                    .stream
                    .peer_cred()
                    .ok()
                    .and_then(|cred| cred.pid());
                let client = self.daemon.clients.add(pid);
                let id = client.id;
                self.client = Some(client);
                Reply::ok_with(id as u32)
            }
            Command::SetHostId => match parse::<LockspaceSpec>(payload) {
                Ok(spec) => match ops::add_lockspace(&self.daemon, &spec).await {
                    Ok(()) => Reply::ok(),
                    Err(err) => Reply::err(&err),
                },
                Err(reply) => reply,
            },
            Command::RemLockspace => match parse::<LockspaceSpec>(payload) {
                Ok(spec) => match ops::rem_lockspace(&self.daemon, &spec.name).await {
                    Ok(()) => Reply::ok(),
                    Err(err) => Reply::err(&err),
                },
                Err(reply) => reply,
            },
            Command::Acquire => {
                let Some(client) = self.client.clone() else {
                    return Reply::err(&Error::NotRegistered);
                };
                let guard = match client.begin_command() {
                    Ok(guard) => guard,
                    Err(err) => return Reply::err(&err),
                };
                let reply = match parse::<AcquireRequest>(payload) {
                    Ok(req) => match ops::acquire(&self.daemon, &client, &req).await {
                        Ok(ids) => Reply::ok_with(ids.len() as u32),
                        Err(err) => Reply::err(&err),
                    },
                    Err(reply) => reply,
                };
                drop(guard);
                reply
            }
            Command::Release => {
                let Some(client) = self.client.clone() else {
                    return Reply::err(&Error::NotRegistered);
                };
                let guard = match client.begin_command() {
                    Ok(guard) => guard,
                    Err(err) => return Reply::err(&err),
                };
                let reply = match parse::<ReleaseRequest>(payload) {
                    Ok(req) => match ops::release(&self.daemon, &client, &req).await {
                        Ok(()) => Reply::ok(),
                        Err(err) => Reply::err(&err),
                    },
                    Err(reply) => reply,
                };
                drop(guard);
                reply
            }
            Command::Migrate => {
                let Some(client) = self.client.clone() else {
                    return Reply::err(&Error::NotRegistered);
                };
                let guard = match client.begin_command() {
                    Ok(guard) => guard,
                    Err(err) => return Reply::err(&err),
                };
                let reply = match parse::<MigrateRequest>(payload) {
                    Ok(req) => match ops::migrate(&self.daemon, &client, &req).await {
                        Ok(migrate_reply) => Reply::json(&migrate_reply),
                        Err(err) => Reply::err(&err),
                    },
                    Err(reply) => reply,
                };
                drop(guard);
                reply
            }
            Command::SetOwner => {
                let Some(client) = self.client.clone() else {
                    return Reply::err(&Error::NotRegistered);
                };
                let guard = match client.begin_command() {
                    Ok(guard) => guard,
                    Err(err) => return Reply::err(&err),
                };
                let reply = match parse::<SetOwnerRequest>(payload) {
                    Ok(req) => match ops::set_owner(&self.daemon, &client, &req).await {
                        Ok(ids) => Reply::ok_with(ids.len() as u32),
                        Err(err) => Reply::err(&err),
                    },
                    Err(reply) => reply,
                };
                drop(guard);
                reply
            }
            Command::Request => match parse::<ForceRequest>(payload) {
                Ok(req) => match ops::force_request(&self.daemon, &req).await {
                    Ok(()) => Reply::ok(),
                    Err(err) => Reply::err(&err),
                },
                Err(reply) => reply,
            },
            Command::Status => Reply::json(&self.daemon.status()),
            Command::LogDump => Reply::json(&LogDumpReply {
                lines: self.daemon.log_ring.dump(),
            }),
            Command::Shutdown => {
                warn!("shutdown requested by client");
                self.daemon.cancel.cancel();
                Reply::ok()
            }
        }
    }

    async fn write_reply(&mut self, header: &Header, payload: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(&header.encode()).await?;
        if !payload.is_empty() {
            self.stream.write_all(payload).await?;
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> std::result::Result<T, Reply> {
    serde_json::from_slice(payload)
        .map_err(|err| Reply::err(&Error::BadRequest(format!("bad payload: {err}"))))
}

/// `Ok(None)` is a clean EOF before a header.
async fn read_request(
    stream: &mut UnixStream,
) -> std::io::Result<Option<(Header, Vec<u8>)>> {
    let mut raw = [0u8; HEADER_LEN];
    match stream.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let header = Header::decode(&raw);
    if header.length > crate::protocol::MAX_PAYLOAD_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("payload length {} over limit", header.length),
        ));
    }
    let len = header.length as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    Ok(Some((header, payload)))
}
