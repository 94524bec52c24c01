//! Typed event hub with ordered subscriber tiers.
//!
//! The dispatcher and the transfer layer only ever publish events; they
//! never call shell code directly. Subscribers register in a tier, and
//! publication walks tiers in order (core consumers before the shell),
//! preserving the priority semantics of the original name-keyed bus with
//! a typed channel per event kind.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Subscriber tiers, walked in declaration order on publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// Engine-internal consumers (storage, transfer bookkeeping).
    Core,
    /// The graphical shell and other outer surfaces.
    Shell,
}

/// Events published by the session layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A chat or group-chat message was received and normalized.
    MessageReceived {
        peer: String,
        thread_id: Option<String>,
        body: String,
        group_chat: bool,
    },
    /// An error-typed message arrived; an error record was persisted.
    MessageError {
        peer: String,
        error_code: Option<String>,
        error_text: String,
    },
    /// A session was terminated, locally or during teardown.
    SessionTerminated { peer: String, thread_id: String },
    /// An agent/gateway unregistration completed.
    AgentRemoved { agent: String },
    /// Metacontact definitions arrived from private storage.
    MetacontactsReceived,
    /// The roster arrived (or roster support was found missing and the
    /// fallback path completed).
    RosterReceived,
    /// The nested-group delimiter is known.
    DelimiterReceived { delimiter: String },
    /// A publish-subscribe node configuration form arrived.
    PepConfigReceived { node: String },
    /// A pending request hit its deadline; `notice` is user-visible.
    RequestTimedOut { id: String, notice: String },
    /// A room failed the stable-id archive requirement and was added to
    /// the do-not-trust-archive list.
    ArchiveDistrusted { room: String },
}

type Subscriber = Box<dyn Fn(&SessionEvent) + Send + Sync>;

/// Publish/subscribe hub for [`SessionEvent`].
///
/// Callbacks run inline on the publishing (signaling) task, in tier order
/// then registration order. They must not block.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<(Tier, Subscriber)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber in the given tier.
    pub fn subscribe<F>(&self, tier: Tier, callback: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut subs = self.subscribers.lock();
        subs.push((tier, Box::new(callback)));
        subs.sort_by_key(|(t, _)| *t);
    }

    /// Deliver an event to every subscriber, core tier first.
    pub fn publish(&self, event: &SessionEvent) {
        for (_, callback) in self.subscribers.lock().iter() {
            callback(event);
        }
    }
}
