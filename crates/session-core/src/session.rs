//! The session entity: one tracked conversational thread with one peer.
//!
//! Ordinary chat sessions are indexed by the peer's bare address; a
//! private-room chat is only distinguishable by the full address, so those
//! are indexed fully qualified. The registry enforces at most one session
//! per (index address, thread id).

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use peerwave_stanza_core::PeerAddr;

/// Kind of conversation a session tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    /// Ordinary one-to-one chat, keyed by bare address.
    Chat,
    /// Private chat with a room occupant, keyed by full address.
    PrivateRoom,
}

/// Shell-side controller a session may be bound to.
///
/// The session holds this weakly; the shell owns the controller and may
/// drop it at any time without telling the session.
pub trait SessionControl: Send + Sync {
    /// A delivery receipt arrived for a message we sent.
    fn receipt_acknowledged(&self, stanza_id: &str);
}

/// Mutable portion of a session. Only the signaling task writes here.
struct SessionState {
    last_send: Option<Instant>,
    received_thread_id: bool,
    encryption_enabled: bool,
    control: Weak<dyn SessionControl>,
}

/// A conversational thread between the local account and one peer address.
pub struct Session {
    peer: PeerAddr,
    thread_id: String,
    kind: SessionKind,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create a session. A missing thread id is generated, matching the
    /// behavior for peers that do not thread their messages.
    pub fn new(peer: PeerAddr, thread_id: Option<&str>, kind: SessionKind) -> Self {
        let (thread_id, received) = match thread_id {
            Some(t) if !t.is_empty() => (t.to_string(), true),
            _ => (Uuid::new_v4().to_string(), false),
        };
        Self {
            peer,
            thread_id,
            kind,
            state: Mutex::new(SessionState {
                last_send: None,
                received_thread_id: received,
                encryption_enabled: false,
                control: Weak::<NoControl>::new(),
            }),
        }
    }

    /// Peer address as given at creation (full for private-room sessions).
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Conversation thread identifier.
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Whether the remote party has used this thread id.
    pub fn received_thread_id(&self) -> bool {
        self.state.lock().received_thread_id
    }

    /// Record that the peer sent us this thread id.
    pub fn mark_thread_received(&self) {
        self.state.lock().received_thread_id = true;
    }

    /// Record an outbound send at the given instant.
    pub fn touch_send(&self, now: Instant) {
        self.state.lock().last_send = Some(now);
    }

    /// Instant of the last outbound send on this session.
    pub fn last_send(&self) -> Option<Instant> {
        self.state.lock().last_send
    }

    pub fn encryption_enabled(&self) -> bool {
        self.state.lock().encryption_enabled
    }

    pub fn set_encryption_enabled(&self, enabled: bool) {
        self.state.lock().encryption_enabled = enabled;
    }

    /// Bind a shell controller to this session.
    pub fn attach_control(&self, control: &Arc<dyn SessionControl>) {
        self.state.lock().control = Arc::downgrade(control);
    }

    /// The bound controller, if the shell still holds it.
    pub fn control(&self) -> Option<Arc<dyn SessionControl>> {
        self.state.lock().control.upgrade()
    }

    /// Whether no live controller is bound.
    pub fn is_unattached(&self) -> bool {
        self.control().is_none()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer.to_string())
            .field("thread_id", &self.thread_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Placeholder target for the initial empty weak reference.
struct NoControl;

impl SessionControl for NoControl {
    fn receipt_acknowledged(&self, _stanza_id: &str) {}
}
