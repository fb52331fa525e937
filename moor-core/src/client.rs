//! Registered clients and the per-client command latch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::errors::{Error, Result};

/// One connected client. A registered client owns a pid; the daemon
/// supervises that pid for the lifetime of the connection.
#[derive(Debug)]
pub struct Client {
    pub id: u64,
    pub pid: Option<i32>,
    cmd_active: AtomicBool,
}

impl Client {
    /// Take the command latch: only one of ACQUIRE / RELEASE / MIGRATE /
    /// SETOWNER may be in flight per client.
    pub fn begin_command(self: &Arc<Self>) -> Result<CommandGuard> {
        if self.cmd_active.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        Ok(CommandGuard {
            client: Arc::clone(self),
        })
    }

    pub fn command_active(&self) -> bool {
        self.cmd_active.load(Ordering::Acquire)
    }
}

/// Released on drop so an errored command never wedges the client.
#[derive(Debug)]
pub struct CommandGuard {
    client: Arc<Client>,
}

impl Drop for CommandGuard {
    fn drop(&mut self) {
        self.client.cmd_active.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct ClientTable {
    inner: RwLock<HashMap<u64, Arc<Client>>>,
    next_id: AtomicU64,
}

impl ClientTable {
    pub fn add(&self, pid: Option<i32>) -> Arc<Client> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let client = Arc::new(Client {
            id,
            pid,
            cmd_active: AtomicBool::new(false),
        });
        self.inner.write().unwrap().insert(id, Arc::clone(&client));
        debug!(client = id, ?pid, "client registered");
        client
    }

    pub fn get(&self, id: u64) -> Option<Arc<Client>> {
        self.inner.read().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Client>> {
        self.inner.write().unwrap().remove(&id)
    }

    /// Pids of every registered client, for shutdown supervision.
    pub fn pids(&self) -> Vec<i32> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter_map(|c| c.pid)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.inner.read().unwrap().values().cloned().collect()
    }
}

/// Signal a supervised pid; errors (already-dead pids) are ignored.
pub fn kill_pid(pid: i32, signal: i32) {
    // SAFETY: plain syscall; a stale pid at worst returns ESRCH.
    unsafe {
        libc::kill(pid, signal);
    }
}

/// Whether a pid still exists.
pub fn pid_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let table = ClientTable::default();
        let a = table.add(Some(100));
        let b = table.add(None);
        assert_ne!(a.id, b.id);
        assert_eq!(table.pids(), vec![100]);

        assert!(table.get(a.id).is_some());
        table.remove(a.id);
        assert!(table.get(a.id).is_none());
    }

    #[test]
    fn test_command_latch_is_exclusive() {
        let table = ClientTable::default();
        let client = table.add(Some(1));

        let guard = client.begin_command().unwrap();
        assert!(client.command_active());
        assert!(matches!(client.begin_command(), Err(Error::Busy)));

        drop(guard);
        assert!(!client.command_active());
        let _again = client.begin_command().unwrap();
    }
}
