//! Wire client for the watchdog multiplexer socket.

use std::path::Path;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::{WatchdogLink, WdmdStatus};

/// Default multiplexer socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/wdmd/wdmd.sock";
/// Longest registered connection name.
pub const NAME_SIZE: usize = 128;

const HEADER_MAGIC: u32 = 0x1f40_9d10;
const HEADER_LEN: usize = 16;

const CMD_REGISTER: u32 = 1;
const CMD_REFCOUNT_SET: u32 = 2;
const CMD_REFCOUNT_CLEAR: u32 = 3;
const CMD_TEST_LIVE: u32 = 4;
const CMD_STATUS: u32 = 5;

/// One registered connection to the multiplexer. Dropping the connection
/// without disarming leaves the pet timer running, which is the intended
/// failure mode: a crashed daemon must not outlive its deadlines.
pub struct WdmdClient {
    stream: Mutex<UnixStream>,
    name: String,
}

impl std::fmt::Debug for WdmdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WdmdClient").field("name", &self.name).finish()
    }
}

impl WdmdClient {
    /// Connect and register under `name`.
    pub async fn connect(socket_path: impl AsRef<Path>, name: &str) -> Result<Self> {
        if name.len() >= NAME_SIZE {
            return Err(Error::NameTooLong(name.to_string()));
        }
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let client = WdmdClient {
            stream: Mutex::new(stream),
            name: name.to_string(),
        };
        client.call(CMD_REGISTER, name.as_bytes()).await?;
        debug!(name, "registered with watchdog multiplexer");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pin the multiplexer for the life of the daemon: it keeps petting the
    /// hardware device while any refcount is held.
    pub async fn refcount_set(&self) -> Result<()> {
        self.call(CMD_REFCOUNT_SET, &[]).await.map(|_| ())
    }

    pub async fn refcount_clear(&self) -> Result<()> {
        self.call(CMD_REFCOUNT_CLEAR, &[]).await.map(|_| ())
    }

    async fn call(&self, cmd: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;

        let mut msg = BytesMut::with_capacity(HEADER_LEN + payload.len());
        msg.put_u32_le(HEADER_MAGIC);
        msg.put_u32_le(cmd);
        msg.put_u32_le(payload.len() as u32);
        msg.put_i32_le(0);
        msg.put_slice(payload);
        stream.write_all(&msg).await?;

        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let mut b = &header[..];
        let magic = b.get_u32_le();
        let reply_cmd = b.get_u32_le();
        let len = b.get_u32_le() as usize;
        let code = b.get_i32_le();
        if magic != HEADER_MAGIC {
            return Err(Error::Protocol(format!("bad reply magic {magic:#x}")));
        }
        if reply_cmd != cmd {
            return Err(Error::Protocol(format!(
                "reply cmd {reply_cmd} for request {cmd}"
            )));
        }
        if code < 0 {
            return Err(Error::Denied { code });
        }
        let mut payload = vec![0u8; len];
        if len > 0 {
            stream.read_exact(&mut payload).await?;
        }
        Ok(payload)
    }
}

#[async_trait]
impl WatchdogLink for WdmdClient {
    async fn arm(&self, renew_ts: u64, expire_ts: u64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(16);
        payload.put_u64_le(renew_ts);
        payload.put_u64_le(expire_ts);
        self.call(CMD_TEST_LIVE, &payload).await.map(|_| ())
    }

    async fn disarm(&self) -> Result<()> {
        // (0, 0) withdraws the pet timer
        self.arm(0, 0).await
    }

    async fn status(&self) -> Result<WdmdStatus> {
        let payload = self.call(CMD_STATUS, &[]).await?;
        if payload.len() < 16 {
            return Err(Error::Protocol(format!(
                "status reply too short: {}",
                payload.len()
            )));
        }
        let mut b = &payload[..];
        Ok(WdmdStatus {
            test_interval: b.get_u32_le(),
            fire_timeout: b.get_u32_le(),
            last_keepalive: b.get_u64_le(),
        })
    }
}

/// Watchdog disabled by configuration: arming always succeeds and nothing
/// ever fences. For development rigs and tests only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWatchdog;

#[async_trait]
impl WatchdogLink for NullWatchdog {
    async fn arm(&self, _renew_ts: u64, _expire_ts: u64) -> Result<()> {
        Ok(())
    }

    async fn disarm(&self) -> Result<()> {
        Ok(())
    }

    async fn status(&self) -> Result<WdmdStatus> {
        Ok(WdmdStatus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Minimal multiplexer double: answers every command in order, echoing
    /// the wire contract the client expects.
    async fn fake_wdmd(listener: UnixListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let mut header = [0u8; HEADER_LEN];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let mut b = &header[..];
            let magic = b.get_u32_le();
            let cmd = b.get_u32_le();
            let len = b.get_u32_le() as usize;
            let _ = b.get_i32_le();
            assert_eq!(magic, HEADER_MAGIC);
            let mut payload = vec![0u8; len];
            if len > 0 {
                stream.read_exact(&mut payload).await.unwrap();
            }

            let mut reply = BytesMut::new();
            let body: Vec<u8> = match cmd {
                CMD_STATUS => {
                    let mut body = BytesMut::new();
                    body.put_u32_le(10);
                    body.put_u32_le(40);
                    body.put_u64_le(12345);
                    body.to_vec()
                }
                _ => Vec::new(),
            };
            reply.put_u32_le(HEADER_MAGIC);
            reply.put_u32_le(cmd);
            reply.put_u32_le(body.len() as u32);
            reply.put_i32_le(0);
            reply.put_slice(&body);
            stream.write_all(&reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_register_arm_status_disarm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wdmd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_wdmd(listener));

        let client = WdmdClient::connect(&path, "sanlock_vg01_hostid3").await.unwrap();
        assert_eq!(client.name(), "sanlock_vg01_hostid3");

        client.refcount_set().await.unwrap();
        client.arm(100, 140).await.unwrap();

        let status = client.status().await.unwrap();
        assert_eq!(status.test_interval, 10);
        assert_eq!(status.fire_timeout, 40);
        assert_eq!(status.last_keepalive, 12345);

        client.disarm().await.unwrap();
        client.refcount_clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_name_length_checked() {
        let long = "x".repeat(NAME_SIZE);
        let err = WdmdClient::connect("/nonexistent", &long).await.unwrap_err();
        assert!(matches!(err, Error::NameTooLong(_)));
    }

    #[tokio::test]
    async fn test_null_watchdog() {
        let wd = NullWatchdog;
        wd.arm(1, 2).await.unwrap();
        wd.disarm().await.unwrap();
        assert_eq!(wd.status().await.unwrap(), WdmdStatus::default());
    }
}
