//! The token manager: every lease granted to a local pid is a token, and
//! every token walks the same state machine. Tokens are id-indexed in one
//! table; worker tasks hold ids, never references.

use std::collections::HashMap;
use std::sync::Mutex;

use delta_lease::monotime;
use ondisk::LeaderRecord;

use crate::errors::{Error, Result};

/// Most leases one pid may hold.
pub const MAX_LEASES: usize = 8;
/// How long a saved-for-reacquire token keeps its disk lease.
pub const SAVED_EXPIRE_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Allocating,
    Opening,
    Acquiring,
    Held,
    Releasing,
    Freed,
    /// Released by its pid with the remember flag; the disk lease stays
    /// held briefly for a successor pid of the same owner.
    SavedForReacquire,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Allocating => "allocating",
            TokenState::Opening => "opening",
            TokenState::Acquiring => "acquiring",
            TokenState::Held => "held",
            TokenState::Releasing => "releasing",
            TokenState::Freed => "freed",
            TokenState::SavedForReacquire => "saved",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub id: u64,
    pub client_id: u64,
    pub pid: i32,
    pub state: TokenState,
    pub token: paxos_lease::Token,
    /// Leader committed by our acquire; the baseline for release checks.
    pub leader: Option<LeaderRecord>,
    pub shared: bool,
    /// Source side of a migration: the lease now belongs to the
    /// destination host and must not be released on disk.
    pub migrating: bool,
    saved_at: u64,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    tokens: HashMap<u64, TokenEntry>,
}

#[derive(Debug, Default)]
pub struct TokenManager {
    inner: Mutex<Inner>,
}

impl TokenManager {
    /// Allocate a token in `Allocating` state, enforcing the per-pid cap
    /// and one-token-per-resource.
    pub fn allocate(
        &self,
        client_id: u64,
        pid: i32,
        token: paxos_lease::Token,
        shared: bool,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let held = inner
            .tokens
            .values()
            .filter(|e| e.pid == pid && e.state != TokenState::Freed)
            .count();
        if held >= MAX_LEASES {
            return Err(Error::TooManyLeases {
                pid,
                limit: MAX_LEASES,
            });
        }
        if inner
            .tokens
            .values()
            .any(|e| e.pid == pid && e.token.resource_name == token.resource_name)
        {
            return Err(Error::LeaseExists {
                pid,
                resource: token.resource_name.clone(),
            });
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.tokens.insert(
            id,
            TokenEntry {
                id,
                client_id,
                pid,
                state: TokenState::Allocating,
                token,
                leader: None,
                shared,
                migrating: false,
                saved_at: 0,
            },
        );
        Ok(id)
    }

    pub fn set_state(&self, id: u64, state: TokenState) {
        if let Some(entry) = self.inner.lock().unwrap().tokens.get_mut(&id) {
            entry.state = state;
        }
    }

    /// Apply `f` to the entry, if it still exists.
    pub fn update<F: FnOnce(&mut TokenEntry)>(&self, id: u64, f: F) -> bool {
        match self.inner.lock().unwrap().tokens.get_mut(&id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: u64) -> Option<TokenEntry> {
        self.inner.lock().unwrap().tokens.get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<TokenEntry> {
        self.inner.lock().unwrap().tokens.remove(&id)
    }

    pub fn find(&self, pid: i32, resource: &str) -> Option<TokenEntry> {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .values()
            .find(|e| e.pid == pid && e.token.resource_name == resource)
            .cloned()
    }

    pub fn by_client(&self, client_id: u64) -> Vec<TokenEntry> {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .values()
            .filter(|e| e.client_id == client_id)
            .cloned()
            .collect()
    }

    pub fn held(&self) -> Vec<TokenEntry> {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .values()
            .filter(|e| e.state == TokenState::Held)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<TokenEntry> {
        self.inner.lock().unwrap().tokens.values().cloned().collect()
    }

    /// Park a held token: detached from its pid, disk lease retained.
    pub fn save_for_reacquire(&self, id: u64) {
        if let Some(entry) = self.inner.lock().unwrap().tokens.get_mut(&id) {
            entry.state = TokenState::SavedForReacquire;
            entry.saved_at = monotime();
        }
    }

    /// Hand a fresh-enough saved token to a new pid, skipping the ballot.
    pub fn take_saved(&self, resource: &str, client_id: u64, pid: i32) -> Option<TokenEntry> {
        let mut inner = self.inner.lock().unwrap();
        let now = monotime();
        let id = inner.tokens.values().find_map(|e| {
            (e.state == TokenState::SavedForReacquire
                && e.token.resource_name == resource
                && now.saturating_sub(e.saved_at) <= SAVED_EXPIRE_SECONDS)
                .then_some(e.id)
        })?;
        let entry = inner.tokens.get_mut(&id).expect("id just found");
        entry.client_id = client_id;
        entry.pid = pid;
        entry.state = TokenState::Held;
        entry.saved_at = 0;
        Some(entry.clone())
    }

    /// Saved tokens past their window; the caller releases them on disk.
    pub fn expired_saved(&self) -> Vec<TokenEntry> {
        let now = monotime();
        self.inner
            .lock()
            .unwrap()
            .tokens
            .values()
            .filter(|e| {
                e.state == TokenState::SavedForReacquire
                    && now.saturating_sub(e.saved_at) > SAVED_EXPIRE_SECONDS
            })
            .cloned()
            .collect()
    }

    /// Any non-freed token in this lockspace.
    pub fn lockspace_in_use(&self, space_name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .values()
            .any(|e| e.token.space_name == space_name && e.state != TokenState::Freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delta_lease::Timeouts;
    use sector_io::SyncDisk;

    fn sample_token(file: &tempfile::NamedTempFile, resource: &str) -> paxos_lease::Token {
        let disk = SyncDisk::open_buffered(file.path(), 0).unwrap();
        paxos_lease::Token::new(
            "vg01",
            resource,
            vec![disk],
            512,
            1,
            1,
            Timeouts::default(),
        )
        .unwrap()
    }

    fn scratch_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        file
    }

    #[test]
    fn test_allocate_caps_per_pid() {
        let file = scratch_file();
        let mgr = TokenManager::default();
        for i in 0..MAX_LEASES {
            mgr.allocate(1, 42, sample_token(&file, &format!("lv{i}")), false)
                .unwrap();
        }
        let err = mgr
            .allocate(1, 42, sample_token(&file, "lv-extra"), false)
            .unwrap_err();
        assert!(matches!(err, Error::TooManyLeases { pid: 42, .. }));

        // a different pid is not affected
        mgr.allocate(2, 43, sample_token(&file, "lv0"), false).unwrap();
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let file = scratch_file();
        let mgr = TokenManager::default();
        mgr.allocate(1, 42, sample_token(&file, "lv0"), false).unwrap();
        let err = mgr
            .allocate(1, 42, sample_token(&file, "lv0"), false)
            .unwrap_err();
        assert!(matches!(err, Error::LeaseExists { .. }));
    }

    #[test]
    fn test_state_walk_and_find() {
        let file = scratch_file();
        let mgr = TokenManager::default();
        let id = mgr.allocate(1, 42, sample_token(&file, "lv0"), false).unwrap();

        for state in [
            TokenState::Opening,
            TokenState::Acquiring,
            TokenState::Held,
        ] {
            mgr.set_state(id, state);
            assert_eq!(mgr.get(id).unwrap().state, state);
        }
        assert_eq!(mgr.held().len(), 1);
        assert!(mgr.find(42, "lv0").is_some());
        assert!(mgr.find(42, "lv1").is_none());
        assert!(mgr.lockspace_in_use("vg01"));
        assert!(!mgr.lockspace_in_use("vg02"));

        mgr.remove(id);
        assert!(mgr.get(id).is_none());
    }

    #[test]
    fn test_saved_bucket_reassigns_fresh_tokens() {
        let file = scratch_file();
        let mgr = TokenManager::default();
        let id = mgr.allocate(1, 42, sample_token(&file, "lv0"), false).unwrap();
        mgr.set_state(id, TokenState::Held);

        mgr.save_for_reacquire(id);
        assert!(mgr.held().is_empty());

        let taken = mgr.take_saved("lv0", 7, 99).expect("fresh saved token");
        assert_eq!(taken.id, id);
        assert_eq!(taken.pid, 99);
        assert_eq!(taken.state, TokenState::Held);

        // once taken it is held again, not in the bucket
        assert!(mgr.take_saved("lv0", 8, 100).is_none());
        assert!(mgr.expired_saved().is_empty());
    }
}
