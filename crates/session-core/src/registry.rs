//! Session registry: lookup, creation and "best session" heuristics.
//!
//! The registry maps (index address, thread id) to a session, where the
//! index address is the bare peer address for ordinary chats and the full
//! address for private-room chats. Sessions are created lazily by the
//! dispatcher on the signaling task; everyone else only reads.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use peerwave_stanza_core::PeerAddr;

use crate::dispatcher::RoomDirectory;
use crate::session::{Session, SessionKind};

/// Registry of all sessions a connection holds.
pub struct SessionRegistry {
    /// index address string -> thread id -> session
    sessions: DashMap<String, HashMap<String, Arc<Session>>>,
    rooms: Arc<dyn RoomDirectory>,
}

impl SessionRegistry {
    pub fn new(rooms: Arc<dyn RoomDirectory>) -> Self {
        Self {
            sessions: DashMap::new(),
            rooms,
        }
    }

    /// Classify a peer and produce its index address.
    fn index_of(&self, peer: &PeerAddr) -> (String, SessionKind) {
        if self.rooms.is_room_occupant(peer) {
            (peer.to_string(), SessionKind::PrivateRoom)
        } else {
            (peer.bare().to_string(), SessionKind::Chat)
        }
    }

    /// Resolve an existing session or construct one. Idempotent: the same
    /// (peer, thread id) always yields the same instance, and a threadless
    /// lookup reuses the current null session rather than piling up new
    /// ones.
    pub fn get_or_create(&self, peer: &PeerAddr, thread_id: Option<&str>) -> Arc<Session> {
        if let Some(found) = self.find(peer, thread_id) {
            return found;
        }
        self.make_new(peer, thread_id)
    }

    /// Open a fresh session unconditionally. Outbound sends that start a
    /// new exchange on purpose use this instead of `get_or_create`.
    pub fn make_new(&self, peer: &PeerAddr, thread_id: Option<&str>) -> Arc<Session> {
        let (index, kind) = self.index_of(peer);
        let session = Arc::new(Session::new(peer.clone(), thread_id, kind));
        debug!(peer = %peer, thread = session.thread_id(), ?kind, "created session");
        self.sessions
            .entry(index)
            .or_default()
            .insert(session.thread_id().to_string(), session.clone());
        session
    }

    /// Thread-aware lookup. An absent thread id falls back to the
    /// null-session search for clients that omit threading.
    pub fn find(&self, peer: &PeerAddr, thread_id: Option<&str>) -> Option<Arc<Session>> {
        let (index, _) = self.index_of(peer);
        match thread_id.filter(|t| !t.is_empty()) {
            Some(thread) => self
                .sessions
                .get(&index)
                .and_then(|threads| threads.get(thread).cloned()),
            None => self.find_null_session(&index),
        }
    }

    /// The most recently sent-on ordinary chat session for this peer that
    /// has not yet received a thread id from the remote party.
    fn find_null_session(&self, index: &str) -> Option<Arc<Session>> {
        let threads = self.sessions.get(index)?;
        threads
            .values()
            .filter(|s| s.kind() == SessionKind::Chat && !s.received_thread_id())
            .max_by_key(|s| s.last_send())
            .cloned()
    }

    /// The session most recently used for sending to this peer, regardless
    /// of thread state. Used to route delayed replies.
    pub fn latest(&self, peer: &PeerAddr) -> Option<Arc<Session>> {
        let (index, _) = self.index_of(peer);
        let threads = self.sessions.get(&index)?;
        threads.values().max_by_key(|s| s.last_send()).cloned()
    }

    /// An active ordinary session with no live controller bound, optionally
    /// restricted to one resource. The shell uses this to adopt orphans.
    pub fn find_unattached(&self, peer: &PeerAddr, resource: Option<&str>) -> Option<Arc<Session>> {
        let (index, _) = self.index_of(peer);
        let threads = self.sessions.get(&index)?;
        threads
            .values()
            .filter(|s| s.kind() == SessionKind::Chat && s.is_unattached())
            .find(|s| match resource {
                Some(res) => s.peer().resource() == Some(res),
                None => true,
            })
            .cloned()
    }

    /// All sessions for a peer.
    pub fn sessions_for(&self, peer: &PeerAddr) -> Vec<Arc<Session>> {
        let (index, _) = self.index_of(peer);
        self.sessions
            .get(&index)
            .map(|threads| threads.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove one session. The enclosing peer entry goes away with its last
    /// thread.
    pub fn remove(&self, peer: &PeerAddr, thread_id: &str) -> Option<Arc<Session>> {
        let (index, _) = self.index_of(peer);
        let mut removed = None;
        if let Some(mut threads) = self.sessions.get_mut(&index) {
            removed = threads.remove(thread_id);
        }
        self.sessions.remove_if(&index, |_, threads| threads.is_empty());
        removed
    }

    /// Drain every session, clearing the registry. The caller decides what
    /// termination signaling to emit for each returned session; this must
    /// stay safe during connection teardown, so the registry itself sends
    /// nothing.
    pub fn terminate_all(&self) -> Vec<Arc<Session>> {
        let mut drained = Vec::new();
        self.sessions.retain(|_, threads| {
            drained.extend(threads.drain().map(|(_, s)| s));
            false
        });
        drained
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::NoRooms;
    use std::time::Instant;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(NoRooms))
    }

    fn peer(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let reg = registry();
        let a = reg.get_or_create(&peer("bob@example.org"), Some("t1"));
        let b = reg.get_or_create(&peer("bob@example.org"), Some("t1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn full_address_indexes_bare_for_ordinary_chat() {
        let reg = registry();
        let a = reg.get_or_create(&peer("bob@example.org/desk"), Some("t1"));
        let b = reg.find(&peer("bob@example.org"), Some("t1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn threadless_lookup_reuses_the_existing_null_session() {
        let reg = registry();
        let a = reg.get_or_create(&peer("bob@example.org"), None);
        let b = reg.get_or_create(&peer("bob@example.org"), None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn null_session_search_prefers_last_sent() {
        let reg = registry();
        let old = reg.make_new(&peer("bob@example.org"), None);
        let new = reg.make_new(&peer("bob@example.org"), None);
        assert!(!Arc::ptr_eq(&old, &new));

        let base = Instant::now();
        old.touch_send(base);
        new.touch_send(base + std::time::Duration::from_secs(1));

        let found = reg.find(&peer("bob@example.org"), None).unwrap();
        assert!(Arc::ptr_eq(&found, &new));

        // A session whose thread id the peer has echoed no longer matches.
        new.mark_thread_received();
        let found = reg.find(&peer("bob@example.org"), None).unwrap();
        assert!(Arc::ptr_eq(&found, &old));
    }

    #[test]
    fn terminate_all_empties_the_registry() {
        let reg = registry();
        reg.get_or_create(&peer("bob@example.org"), Some("t1"));
        reg.get_or_create(&peer("eve@example.org"), Some("t2"));

        let drained = reg.terminate_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(reg.len(), 0);
        assert!(reg.find(&peer("bob@example.org"), Some("t1")).is_none());
        assert!(reg.latest(&peer("eve@example.org")).is_none());
    }

    #[test]
    fn remove_cleans_up_peer_entry() {
        let reg = registry();
        let s = reg.get_or_create(&peer("bob@example.org"), Some("t1"));
        assert!(reg.remove(&peer("bob@example.org"), s.thread_id()).is_some());
        assert_eq!(reg.len(), 0);
        assert!(reg.remove(&peer("bob@example.org"), "t1").is_none());
    }
}
