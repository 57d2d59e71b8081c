//! Session registry: the single source of truth for live users.
use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::{now_iso, Participant};

/// Write side of a user's control connection. Lines pushed here are written
/// by that connection's writer task in order, so no two outbound JSON
/// objects interleave.
pub type ClientHandle = UnboundedSender<String>;

/// Everything the registry knows about one live user.
#[derive(Clone)]
pub struct UserEntry {
    pub username: String,
    pub joined_at: String,
    pub handle: ClientHandle,
}

struct Inner {
    next_uid: u32,
    users: HashMap<u32, UserEntry>,
}

/// uid issuance and the uid → user mapping. All operations take the single
/// lock briefly; snapshots are copied out so callers never hold it while
/// doing I/O.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { next_uid: 1, users: HashMap::new() }) }
    }

    /// Issue the next uid and record the user. uids are monotonic and never
    /// reused within one server process. An empty name falls back to
    /// `user_<uid>`.
    pub fn register(&self, username: &str, handle: ClientHandle) -> Participant {
        let mut inner = self.inner.lock();
        let uid = inner.next_uid;
        inner.next_uid += 1;
        let username = if username.is_empty() { format!("user_{uid}") } else { username.to_string() };
        let joined_at = now_iso();
        inner.users.insert(
            uid,
            UserEntry { username: username.clone(), joined_at: joined_at.clone(), handle },
        );
        Participant { uid, username, joined_at }
    }

    /// Remove a user. Idempotent: a second call for the same uid returns
    /// None and changes nothing.
    pub fn unregister(&self, uid: u32) -> Option<UserEntry> {
        self.inner.lock().users.remove(&uid)
    }

    pub fn resolve(&self, uid: u32) -> Option<String> {
        self.inner.lock().users.get(&uid).map(|u| u.username.clone())
    }

    pub fn handle_of(&self, uid: u32) -> Option<ClientHandle> {
        self.inner.lock().users.get(&uid).map(|u| u.handle.clone())
    }

    /// Copy of the current participant set, sorted by uid for stable lists.
    pub fn snapshot(&self) -> Vec<Participant> {
        let inner = self.inner.lock();
        let mut list: Vec<_> = inner
            .users
            .iter()
            .map(|(uid, u)| Participant {
                uid: *uid,
                username: u.username.clone(),
                joined_at: u.joined_at.clone(),
            })
            .collect();
        drop(inner);
        list.sort_by_key(|p| p.uid);
        list
    }

    /// Copy of all write handles, for fan-out without holding the lock.
    pub fn handles(&self) -> Vec<(u32, ClientHandle)> {
        self.inner.lock().users.iter().map(|(uid, u)| (*uid, u.handle.clone())).collect()
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.inner.lock().users.contains_key(&uid)
    }

    /// Queue one message on a user's connection. Returns false when the uid
    /// is unknown or its writer task has already gone away.
    pub fn send_to(&self, uid: u32, msg: &crate::protocol::ServerMessage) -> bool {
        let Some(handle) = self.handle_of(uid) else { return false };
        handle.send(msg.to_line()).is_ok()
    }

    /// Fan a message out to every connection except `exclude`. Serialization
    /// happens once; a dead peer is logged and skipped, the rest still get
    /// the message. Returns the uids whose writer is gone (their reader
    /// tasks will notice and run the disconnect cascade).
    pub fn broadcast(&self, msg: &crate::protocol::ServerMessage, exclude: Option<u32>) -> Vec<u32> {
        let line = msg.to_line();
        let mut dead = Vec::new();
        for (uid, handle) in self.handles() {
            if exclude == Some(uid) {
                continue;
            }
            if handle.send(line.clone()).is_err() {
                log::warn!("[CONTROL] broadcast to uid={uid} failed; scheduling disconnect");
                dead.push(uid);
            }
        }
        dead
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
