//! Protocol event dispatcher.
//!
//! The dispatcher receives decoded inbound stanzas, matches replies against
//! the pending-request registry (sweeping expired deadlines on the way),
//! routes chat traffic to sessions, and publishes typed events. It runs on
//! the single signaling task; every collaborator is an injected handle, and
//! every handler converts malformed remote input into a logged no-op.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use peerwave_stanza_core::{ns, IqKind, MessageKind, PeerAddr, Stanza, StanzaKind};

use crate::clock::Clock;
use crate::errors::{Result, SessionError};
use crate::events::{EventHub, SessionEvent};
use crate::pending::{PendingRegistry, WaitReason};
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Outbound side of the protocol transport, plus liveness.
pub trait SignalingChannel: Send + Sync {
    /// Whether the connection is still up. Handlers become no-ops when it
    /// is not.
    fn is_connected(&self) -> bool;

    /// Queue a stanza for send.
    fn send(&self, stanza: Stanza) -> Result<()>;
}

/// The multi-step startup handshake driven by wait-reason side effects:
/// privacy lists, then metacontacts, then delimiter, then roster.
pub trait StartupHandshake: Send + Sync {
    fn request_metacontacts(&self);
    fn request_delimiter(&self);
    fn request_roster(&self);
    fn request_privacy_list(&self, name: &str);
}

/// Persistent log/store. Fire-and-forget; must never block signaling.
pub trait MessageStore: Send + Sync {
    fn record_message(
        &self,
        peer: &str,
        timestamp: chrono::DateTime<chrono::Utc>,
        body: &str,
        group_chat: bool,
    );

    fn record_error(
        &self,
        peer: &str,
        timestamp: chrono::DateTime<chrono::Utc>,
        error_code: Option<&str>,
        error_text: &str,
    );
}

/// Knowledge about rooms: which peers are room occupants (private chat)
/// and which rooms mandate stable stanza ids for trustworthy archives.
pub trait RoomDirectory: Send + Sync {
    fn is_room_occupant(&self, peer: &PeerAddr) -> bool;

    fn requires_stable_ids(&self, room: &PeerAddr) -> bool {
        let _ = room;
        false
    }
}

/// Directory that knows no rooms. Every peer is an ordinary chat contact.
pub struct NoRooms;

impl RoomDirectory for NoRooms {
    fn is_room_occupant(&self, _peer: &PeerAddr) -> bool {
        false
    }
}

/// Consumer of session-embedded signaling iqs (the transfer layer).
/// Returns true when the stanza was consumed.
pub trait SignalingHandler: Send + Sync {
    fn handle_signaling(&self, stanza: &Stanza) -> bool;
}

/// Optional-feature flags degraded in place when the server answers a
/// probe with an error. Degrading never fails the connection.
#[derive(Debug)]
pub struct FeatureFlags {
    private_storage: AtomicBool,
    roster: AtomicBool,
    privacy_rules: AtomicBool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            private_storage: AtomicBool::new(true),
            roster: AtomicBool::new(true),
            privacy_rules: AtomicBool::new(true),
        }
    }
}

impl FeatureFlags {
    pub fn private_storage_supported(&self) -> bool {
        self.private_storage.load(Ordering::Relaxed)
    }

    pub fn roster_supported(&self) -> bool {
        self.roster.load(Ordering::Relaxed)
    }

    pub fn privacy_rules_supported(&self) -> bool {
        self.privacy_rules.load(Ordering::Relaxed)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deadline for outbound requests awaiting an answer.
    pub request_timeout: Duration,
    /// Whether inbound receipt requests are answered.
    pub answer_receipts: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            answer_receipts: true,
        }
    }
}

/// The protocol event dispatcher.
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<SessionRegistry>,
    pending: PendingRegistry,
    hub: Arc<EventHub>,
    channel: Arc<dyn SignalingChannel>,
    handshake: Arc<dyn StartupHandshake>,
    store: Arc<dyn MessageStore>,
    rooms: Arc<dyn RoomDirectory>,
    clock: Arc<dyn Clock>,
    features: FeatureFlags,
    signaling: Mutex<Option<Arc<dyn SignalingHandler>>>,
    distrusted_archives: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<SessionRegistry>,
        hub: Arc<EventHub>,
        channel: Arc<dyn SignalingChannel>,
        handshake: Arc<dyn StartupHandshake>,
        store: Arc<dyn MessageStore>,
        rooms: Arc<dyn RoomDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            pending: PendingRegistry::new(),
            hub,
            channel,
            handshake,
            store,
            rooms,
            clock,
            features: FeatureFlags::default(),
            signaling: Mutex::new(None),
            distrusted_archives: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn features(&self) -> &FeatureFlags {
        &self.features
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Bind the consumer of session-embedded signaling (transfer layer).
    pub fn set_signaling_handler(&self, handler: Arc<dyn SignalingHandler>) {
        *self.signaling.lock() = Some(handler);
    }

    /// Rooms whose archives are not to be trusted.
    pub fn distrusted_archives(&self) -> Vec<String> {
        self.distrusted_archives.lock().iter().cloned().collect()
    }

    /// Issue an outbound request that expects a correlated reply. Assigns
    /// the request id, registers the pending entry with a deadline, then
    /// sends. Returns the id.
    pub fn send_request(
        &self,
        mut request: Stanza,
        reason: WaitReason,
        timeout_notice: impl Into<String>,
    ) -> Result<String> {
        if !self.channel.is_connected() {
            return Err(SessionError::ConnectionClosed);
        }
        let id = match request.id() {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                request.set_attr("id", id.clone());
                id
            }
        };
        let deadline = self.clock.now() + self.config.request_timeout;
        self.pending
            .register(id.clone(), reason, deadline, timeout_notice)?;
        if let Err(e) = self.channel.send(request) {
            // Roll back so the id cannot fire a bogus timeout later.
            self.pending.take(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Entry point for every decoded inbound stanza.
    pub fn handle_stanza(&self, stanza: &Stanza) {
        match stanza.kind() {
            StanzaKind::Iq => self.handle_iq(stanza),
            StanzaKind::Message => self.handle_message(stanza),
            StanzaKind::Presence | StanzaKind::Other => {
                debug!(name = %stanza.name, "ignoring stanza outside the session core");
            }
        }
    }

    /// Reply/request matching. Expired deadlines are swept opportunistically
    /// before any lookup, so a late reply for a timed-out id is ignored.
    fn handle_iq(&self, stanza: &Stanza) {
        for (id, notice) in self.pending.sweep(self.clock.now()) {
            self.hub.publish(&SessionEvent::RequestTimedOut { id, notice });
        }

        let Some(id) = stanza.id() else {
            debug!("iq without id, ignoring");
            return;
        };

        if let Some(request) = self.pending.take(id) {
            self.run_wait_reason(request.reason, stanza);
            return;
        }

        // Not ours: offer it to the session-embedded signaling consumer.
        let handler = self.signaling.lock().clone();
        if let Some(handler) = handler {
            if handler.handle_signaling(stanza) {
                return;
            }
        }
        debug!(%id, "unmatched iq, ignoring");
    }

    /// Side effect of an answered (or error-answered) wait-reason. Each arm
    /// tolerates the connection having dropped mid-wait.
    fn run_wait_reason(&self, reason: WaitReason, reply: &Stanza) {
        let is_error = reply.iq_kind() == Some(IqKind::Error);
        match reason {
            WaitReason::AgentRemoved { agent } => {
                self.hub.publish(&SessionEvent::AgentRemoved {
                    agent: agent.to_string(),
                });
            }
            WaitReason::MetacontactsRequested => {
                if !self.channel.is_connected() {
                    return;
                }
                if !is_error {
                    self.hub.publish(&SessionEvent::MetacontactsReceived);
                } else if !matches!(reply.error_code(), Some("403") | Some("406") | Some("404")) {
                    self.features.private_storage.store(false, Ordering::Relaxed);
                }
                self.handshake.request_delimiter();
            }
            WaitReason::DelimiterRequested => {
                if !self.channel.is_connected() {
                    return;
                }
                if !is_error {
                    let delimiter = reply
                        .child("query")
                        .and_then(|q| q.child_text("roster"))
                        .filter(|d| !d.is_empty())
                        .unwrap_or("::");
                    self.hub.publish(&SessionEvent::DelimiterReceived {
                        delimiter: delimiter.to_string(),
                    });
                } else {
                    self.features.private_storage.store(false, Ordering::Relaxed);
                }
                // Connection startup continues by requesting the roster.
                self.handshake.request_roster();
            }
            WaitReason::RosterRequested => {
                if is_error {
                    self.features.roster.store(false, Ordering::Relaxed);
                }
                self.hub.publish(&SessionEvent::RosterReceived);
            }
            WaitReason::PrivacyListRequested => {
                if !self.channel.is_connected() {
                    return;
                }
                if !is_error {
                    let default_list = reply.child("query").and_then(|q| {
                        q.children
                            .iter()
                            .find(|c| c.name == "default")
                            .and_then(|d| d.attr("name"))
                    });
                    if let Some(name) = default_list {
                        self.handshake.request_privacy_list(name);
                    }
                } else {
                    self.features.privacy_rules.store(false, Ordering::Relaxed);
                }
                // Metacontacts are asked before the roster either way.
                self.handshake.request_metacontacts();
            }
            WaitReason::PepConfigRequested => {
                if is_error {
                    return;
                }
                let node = reply
                    .child("pubsub")
                    .and_then(|p| p.child("configure"))
                    .and_then(|c| c.attr("node"));
                match node {
                    Some(node) => self.hub.publish(&SessionEvent::PepConfigReceived {
                        node: node.to_string(),
                    }),
                    None => debug!("pep config reply without configure node, ignoring"),
                }
            }
        }
    }

    /// Normalize and route an inbound message stanza.
    fn handle_message(&self, stanza: &Stanza) {
        let from = match stanza.from_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "message with unusable sender, ignoring");
                return;
            }
        };

        match stanza.message_kind() {
            MessageKind::Error => self.dispatch_error_message(stanza, &from),
            MessageKind::GroupChat => self.handle_group_chat_message(stanza, &from),
            MessageKind::Chat | MessageKind::Normal => self.handle_chat_message(stanza, &from),
        }
    }

    /// Error replies to messages: persist an error record, publish the
    /// error event, clear nothing else.
    fn dispatch_error_message(&self, stanza: &Stanza, from: &PeerAddr) {
        let body = stanza.child_text("body").unwrap_or("");
        let error_text = stanza.error_text().unwrap_or(body).to_string();
        self.store.record_error(
            &from.bare().to_string(),
            chrono::Utc::now(),
            stanza.error_code(),
            &error_text,
        );
        self.hub.publish(&SessionEvent::MessageError {
            peer: from.to_string(),
            error_code: stanza.error_code().map(str::to_string),
            error_text,
        });
    }

    fn handle_group_chat_message(&self, stanza: &Stanza, from: &PeerAddr) {
        let room = from.bare();
        let stable_id = stanza
            .child_ns("stanza-id", ns::STABLE_ID)
            .and_then(|s| s.attr("id"));

        // A room that mandates stable ids but supplied none cannot be
        // trusted for archive queries.
        if self.rooms.requires_stable_ids(&room) && stable_id.is_none() {
            let newly = self.distrusted_archives.lock().insert(room.to_string());
            if newly {
                info!(room = %room, "room violates stable-id requirement, distrusting archive");
                self.hub.publish(&SessionEvent::ArchiveDistrusted {
                    room: room.to_string(),
                });
            }
        }

        let body = stanza.child_text("body").unwrap_or("");
        // A message straight from the room (no occupant resource) is the
        // room subject/description; it is not logged.
        if body.is_empty() || from.resource().is_none() {
            return;
        }
        self.store
            .record_message(&room.to_string(), chrono::Utc::now(), body, true);
        self.hub.publish(&SessionEvent::MessageReceived {
            peer: from.to_string(),
            thread_id: None,
            body: body.to_string(),
            group_chat: true,
        });
    }

    fn handle_chat_message(&self, stanza: &Stanza, from: &PeerAddr) {
        let thread = stanza.thread();
        let session = self.registry.get_or_create(from, thread);
        if thread.is_some() {
            session.mark_thread_received();
        }

        self.answer_receipt_request(stanza, from, &session);

        if let Some(ack) = stanza.child_ns("received", ns::RECEIPTS) {
            let acked = ack.attr("id").or_else(|| stanza.id());
            if let (Some(acked), Some(control)) = (acked, session.control()) {
                control.receipt_acknowledged(acked);
            }
        }

        let body = stanza.child_text("body").unwrap_or("");
        if body.is_empty() {
            return;
        }
        self.store
            .record_message(&from.bare().to_string(), chrono::Utc::now(), body, false);
        self.hub.publish(&SessionEvent::MessageReceived {
            peer: from.to_string(),
            thread_id: Some(session.thread_id().to_string()),
            body: body.to_string(),
            group_chat: false,
        });
    }

    fn answer_receipt_request(&self, stanza: &Stanza, from: &PeerAddr, session: &Arc<Session>) {
        if stanza.child_ns("request", ns::RECEIPTS).is_none() {
            return;
        }
        if !self.config.answer_receipts || !self.channel.is_connected() {
            return;
        }
        let Some(msg_id) = stanza.id() else {
            return;
        };
        let mut receipt = Stanza::new("message")
            .with_attr("to", from.to_string())
            .with_attr("type", "chat")
            .with_child(Stanza::new_ns("received", ns::RECEIPTS).with_attr("id", msg_id));
        if session.received_thread_id() {
            receipt.add_child(Stanza::new("thread").with_text(session.thread_id()));
        }
        if let Err(e) = self.channel.send(receipt) {
            warn!(error = %e, "failed to send delivery receipt");
        }
    }

    /// Terminate every session, optionally signaling termination to each
    /// peer, then clear the registry. Safe during connection teardown: a
    /// dead channel just skips the signaling.
    pub fn terminate_all(&self, send_termination: bool) {
        let sessions = self.registry.terminate_all();
        for session in sessions {
            if send_termination && self.channel.is_connected() {
                let terminate = Stanza::new("message")
                    .with_attr("to", session.peer().to_string())
                    .with_attr("type", "chat")
                    .with_child(Stanza::new("thread").with_text(session.thread_id()))
                    .with_child(Stanza::new_ns("session-terminate", ns::SIGNALING));
                if let Err(e) = self.channel.send(terminate) {
                    warn!(peer = %session.peer(), error = %e, "failed to signal termination");
                }
            }
            self.hub.publish(&SessionEvent::SessionTerminated {
                peer: session.peer().to_string(),
                thread_id: session.thread_id().to_string(),
            });
        }
    }
}
