//! The transfer manager: signaling glue around the negotiators.
//!
//! [`TransferManager`] owns every live [`TransferNegotiator`], implements
//! the dispatcher's [`SignalingHandler`] seam for inbound signaling, and
//! consumes the completion signals that background work (hashing, candidate
//! connects, the byte flow itself) reports back. All negotiator mutation
//! happens either on the signaling task or inside [`TransferManager::run`],
//! each transition under the attempt's own lock.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use peerwave_session_core::{
    RoomDirectory, Session, SessionRegistry, SignalingChannel, SignalingHandler,
};
use peerwave_stanza_core::{IqKind, PeerAddr, Stanza};

use crate::errors::{Result, TransferError};
use crate::events::TransferEvent;
use crate::file::{FileDescriptor, HashAlgo, TransferRole};
use crate::hash;
use crate::negotiator::{NegotiatorAction, TransferNegotiator};
use crate::signaling::{self, Action};
use crate::transport::{ByteStreamTransport, TransportKind};

/// Completion reports from background work, delivered to the manager's
/// run loop. Background tasks never touch negotiator state directly.
#[derive(Debug)]
pub enum TransferSignal {
    /// The off-task file hash finished.
    HashReady { sid: String, hash: String },
    HashFailed { sid: String, error: String },
    /// An outbound connection to one of the peer's candidates succeeded.
    CandidateConnected {
        sid: String,
        candidate: crate::candidate::TransportCandidate,
    },
    /// Every outbound candidate connection failed.
    CandidateFailed { sid: String },
    /// Bytes moved since the last report.
    IoProgress { sid: String, bytes: u64 },
    /// The byte flow finished. `path` is where a received file landed.
    IoCompleted { sid: String, path: Option<PathBuf> },
    IoFailed { sid: String, error: String },
}

/// Transfer-layer configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Port the local listener binds for declared candidates.
    pub listener_port: u16,
    /// Hash algorithm advertised for outbound files.
    pub hash_algo: HashAlgo,
    /// Transport kind proposed in outbound offers.
    pub transport: TransportKind,
    /// Whether outbound offers request the security precondition.
    pub require_security: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            listener_port: 28011,
            hash_algo: HashAlgo::Sha256,
            transport: TransportKind::Relay,
            require_security: false,
        }
    }
}

/// Owner and driver of all live transfer attempts.
pub struct TransferManager {
    local: PeerAddr,
    config: TransferConfig,
    attempts: DashMap<String, Mutex<TransferNegotiator>>,
    /// Ids of stanzas we sent, so acknowledgements route back by attempt.
    outstanding: DashMap<String, String>,
    channel: Arc<dyn SignalingChannel>,
    transport: Arc<dyn ByteStreamTransport>,
    rooms: Arc<dyn RoomDirectory>,
    registry: Arc<SessionRegistry>,
    events: mpsc::UnboundedSender<TransferEvent>,
    signals_tx: mpsc::UnboundedSender<TransferSignal>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferSignal>>>,
}

impl TransferManager {
    /// Build the manager. The returned receiver carries application-visible
    /// transfer events; [`TransferManager::run`] must be spawned to consume
    /// background completion signals.
    pub fn new(
        local: PeerAddr,
        config: TransferConfig,
        channel: Arc<dyn SignalingChannel>,
        transport: Arc<dyn ByteStreamTransport>,
        rooms: Arc<dyn RoomDirectory>,
        registry: Arc<SessionRegistry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            local,
            config,
            attempts: DashMap::new(),
            outstanding: DashMap::new(),
            channel,
            transport,
            rooms,
            registry,
            events: events_tx,
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
        });
        (manager, events_rx)
    }

    /// Sender half of the completion-signal channel, for transports that
    /// need to report outside the calls that handed them one.
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<TransferSignal> {
        self.signals_tx.clone()
    }

    pub fn active_transfers(&self) -> usize {
        self.attempts.len()
    }

    /// Offer a local file to the peer of the given session. Returns the
    /// transfer session id.
    pub fn offer_file(
        &self,
        session: &Arc<Session>,
        path: PathBuf,
        name: impl Into<String>,
        size: u64,
    ) -> Result<String> {
        if !self.channel.is_connected() {
            return Err(TransferError::Signaling("connection closed".into()));
        }
        let sid = Uuid::new_v4().to_string();
        let peer = session.peer().clone();
        let mut file = FileDescriptor::outbound(name, path, size);
        file.hash_algo = self.config.hash_algo;

        let mut negotiator = TransferNegotiator::outbound(
            sid.clone(),
            self.local.clone(),
            peer.clone(),
            file,
            self.config.transport,
            self.config.require_security,
            self.config.listener_port,
            Arc::downgrade(session),
        );
        if self.rooms.is_room_occupant(&peer) {
            negotiator.set_dst_digest(hash::room_dst_digest(
                &sid,
                &self.local.to_string(),
                &peer.bare().to_string(),
            ));
        }
        let actions = negotiator.start(self.transport.local_candidates(&sid));
        let snapshot = snapshot(&negotiator);
        self.attempts.insert(sid.clone(), Mutex::new(negotiator));
        self.execute(&sid, snapshot, actions, None);
        Ok(sid)
    }

    /// Accept an inbound offer previously surfaced as
    /// [`TransferEvent::Requested`].
    pub fn accept_transfer(&self, sid: &str) -> Result<()> {
        let candidates = self.transport.local_candidates(sid);
        self.drive(sid, |n| n.accept(candidates))
    }

    /// Decline an inbound offer.
    pub fn reject_transfer(&self, sid: &str) -> Result<()> {
        self.cancel_transfer(sid)
    }

    /// Cancel an attempt in any state.
    pub fn cancel_transfer(&self, sid: &str) -> Result<()> {
        self.drive(sid, |n| n.cancel())
    }

    /// Run one transition under the attempt's lock, then execute the
    /// resulting actions with the lock released.
    fn drive<F>(&self, sid: &str, transition: F) -> Result<()>
    where
        F: FnOnce(&mut TransferNegotiator) -> Vec<NegotiatorAction>,
    {
        let (actions, snap) = {
            let entry = self
                .attempts
                .get(sid)
                .ok_or_else(|| TransferError::UnknownSession(sid.to_string()))?;
            let mut negotiator = entry.lock();
            let actions = transition(&mut negotiator);
            (actions, snapshot(&negotiator))
        };
        self.execute(sid, snap, actions, None);
        Ok(())
    }

    fn drive_inbound<F>(&self, sid: &str, stanza: &Stanza, transition: F) -> bool
    where
        F: FnOnce(&mut TransferNegotiator) -> Vec<NegotiatorAction>,
    {
        let Some(entry) = self.attempts.get(sid) else {
            debug!(%sid, "signaling for unknown transfer attempt, ignoring");
            return false;
        };
        let (actions, snap) = {
            let mut negotiator = entry.lock();
            let actions = transition(&mut negotiator);
            (actions, snapshot(&negotiator))
        };
        drop(entry);
        self.execute(sid, snap, actions, Some(stanza));
        true
    }

    fn execute(
        &self,
        sid: &str,
        snap: AttemptSnapshot,
        actions: Vec<NegotiatorAction>,
        inbound: Option<&Stanza>,
    ) {
        for action in actions {
            match action {
                NegotiatorAction::SendStanza(stanza) => {
                    if let Some(id) = stanza.id() {
                        self.outstanding.insert(id.to_string(), sid.to_string());
                    }
                    if let Err(e) = self.channel.send(stanza) {
                        warn!(%sid, error = %e, "failed to send transfer signaling");
                    }
                }
                NegotiatorAction::Ack => {
                    if let Some(stanza) = inbound {
                        if let Err(e) = self.channel.send(stanza.reply_result()) {
                            warn!(%sid, error = %e, "failed to acknowledge transfer signaling");
                        }
                    }
                }
                NegotiatorAction::StartListener { port, auth_token } => {
                    if let Err(e) = self.transport.start_listener(
                        sid,
                        port,
                        &auth_token,
                        &snap.file,
                        snap.role,
                    ) {
                        warn!(%sid, error = %e, "listener failed, abandoning attempt");
                        if let Err(e) = self.drive(sid, |n| n.fail("listener failed")) {
                            debug!(%sid, error = %e, "attempt already gone");
                        }
                        return;
                    }
                }
                NegotiatorAction::ConnectToHosts { candidates } => {
                    self.transport
                        .connect_to_hosts(sid, candidates, self.signals_tx.clone());
                }
                NegotiatorAction::StartStreaming { role, over } => {
                    self.transport
                        .send_file(sid, &snap.file, role, over, self.signals_tx.clone());
                }
                NegotiatorAction::ComputeHash { path, algo } => {
                    hash::spawn_file_hash(sid.to_string(), path, algo, self.signals_tx.clone());
                }
                NegotiatorAction::StopTransport => {
                    self.transport.stop(sid);
                }
                NegotiatorAction::Publish(event) => {
                    let terminal = matches!(
                        event,
                        TransferEvent::Failed { .. }
                            | TransferEvent::Cancelled { .. }
                            | TransferEvent::Completed { .. }
                    );
                    if self.events.send(event).is_err() {
                        debug!(%sid, "transfer event receiver dropped");
                    }
                    if terminal {
                        self.forget(sid);
                    }
                }
            }
        }
    }

    fn forget(&self, sid: &str) {
        self.attempts.remove(sid);
        self.outstanding.retain(|_, v| v != sid);
    }

    /// An inbound offer created a new attempt.
    fn handle_offer(&self, stanza: &Stanza, envelope: &signaling::Envelope<'_>) -> bool {
        let peer = match stanza.from_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "transfer offer with unusable sender, ignoring");
                return true;
            }
        };
        let Some(content) = signaling::content_of(envelope.session) else {
            self.reply_bad_request(stanza);
            return true;
        };
        let file = match signaling::parse_file(content) {
            Ok(file) => file,
            Err(e) => {
                warn!(peer = %peer, error = %e, "malformed transfer offer");
                self.reply_bad_request(stanza);
                return true;
            }
        };
        let Some((kind, transport_el)) = signaling::transport_of(content) else {
            warn!(peer = %peer, "transfer offer without a usable transport");
            self.reply_bad_request(stanza);
            return true;
        };
        let candidates = signaling::parse_candidates(transport_el, &peer.to_string());
        let initiator = envelope
            .session
            .attr("initiator")
            .map(str::to_string)
            .unwrap_or_else(|| peer.to_string());

        if self.attempts.contains_key(&envelope.sid) {
            debug!(sid = %envelope.sid, "duplicate transfer offer, re-acknowledging");
            if let Err(e) = self.channel.send(stanza.reply_result()) {
                warn!(error = %e, "failed to re-acknowledge offer");
            }
            return true;
        }

        // Attach the attempt to the conversational session with this peer.
        let session = self.registry.get_or_create(&peer, None);
        let mut negotiator = TransferNegotiator::inbound(
            envelope.sid.clone(),
            self.local.clone(),
            peer.clone(),
            initiator,
            file,
            kind,
            candidates,
            signaling::has_security(content),
            self.config.listener_port,
            Arc::downgrade(&session),
        );
        if self.rooms.is_room_occupant(&peer) {
            negotiator.set_dst_digest(hash::room_dst_digest(
                &envelope.sid,
                &self.local.to_string(),
                &peer.bare().to_string(),
            ));
        }
        let token = hash::auth_token(
            &envelope.sid,
            &peer.to_string(),
            &self.local.to_string(),
        );
        let actions = negotiator.on_offer_received(token);
        let snap = snapshot(&negotiator);
        self.attempts
            .insert(envelope.sid.clone(), Mutex::new(negotiator));
        self.execute(&envelope.sid, snap, actions, Some(stanza));
        true
    }

    fn handle_transport_info(&self, stanza: &Stanza, envelope: &signaling::Envelope<'_>) -> bool {
        let payload = signaling::content_of(envelope.session)
            .and_then(|c| c.child("transport"))
            .map(|t| {
                (
                    t.child("candidate-error").is_some(),
                    t.child("activated").is_some(),
                    t.child("candidate-used")
                        .and_then(|c| c.attr("cid"))
                        .map(str::to_string),
                )
            });
        let Some((cand_error, activated, cand_used)) = payload else {
            debug!(sid = %envelope.sid, "transport-info without payload, ignoring");
            return true;
        };
        self.drive_inbound(&envelope.sid, stanza, |n| {
            if cand_error {
                n.on_peer_candidate_error()
            } else if activated {
                n.on_activated()
            } else if let Some(cid) = cand_used {
                n.on_peer_candidate_used(&cid)
            } else {
                Vec::new()
            }
        })
    }

    fn handle_reply(&self, stanza: &Stanza, kind: IqKind) -> bool {
        let Some(id) = stanza.id() else {
            return false;
        };
        let Some((_, sid)) = self.outstanding.remove(id) else {
            return false;
        };
        let code = stanza.error_code().map(str::to_string);
        self.drive_inbound(&sid, stanza, |n| match kind {
            IqKind::Result => n.on_iq_result(),
            _ => n.on_iq_error(code.as_deref()),
        });
        true
    }

    fn reply_bad_request(&self, stanza: &Stanza) {
        let mut reply = stanza.reply_result();
        reply.set_attr("type", IqKind::Error.as_str());
        reply.add_child(Stanza::new("error").with_attr("code", "400"));
        if let Err(e) = self.channel.send(reply) {
            warn!(error = %e, "failed to send error reply");
        }
    }

    /// Consume background completion signals until every sender is gone.
    /// Spawn once per manager.
    pub async fn run(self: Arc<Self>) {
        let receiver = self.signals_rx.lock().take();
        let Some(mut receiver) = receiver else {
            warn!("transfer manager run loop started twice");
            return;
        };
        while let Some(signal) = receiver.recv().await {
            match signal {
                TransferSignal::HashReady { sid, hash } => {
                    if let Err(e) = self.drive(&sid, |n| n.on_hash_ready(hash)) {
                        debug!(%sid, error = %e, "hash finished for a gone attempt");
                    }
                }
                TransferSignal::HashFailed { sid, error } => {
                    if let Err(e) = self.drive(&sid, |n| n.fail(&error)) {
                        debug!(%sid, error = %e, "hash failure for a gone attempt");
                    }
                }
                TransferSignal::CandidateConnected { sid, candidate } => {
                    if let Err(e) = self.drive(&sid, |n| n.on_candidate_connected(candidate)) {
                        debug!(%sid, error = %e, "candidate outcome for a gone attempt");
                    }
                }
                TransferSignal::CandidateFailed { sid } => {
                    if let Err(e) = self.drive(&sid, |n| n.on_candidate_failed()) {
                        debug!(%sid, error = %e, "candidate outcome for a gone attempt");
                    }
                }
                TransferSignal::IoProgress { sid, bytes } => {
                    if let Some(entry) = self.attempts.get(&sid) {
                        entry.lock().add_transferred(bytes);
                    }
                }
                TransferSignal::IoCompleted { sid, path } => {
                    self.complete(&sid, path).await;
                }
                TransferSignal::IoFailed { sid, error } => {
                    if let Err(e) = self.drive(&sid, |n| n.fail(&error)) {
                        debug!(%sid, error = %e, "i/o failure for a gone attempt");
                    }
                }
            }
        }
    }

    /// Finish an attempt whose byte flow completed, verifying the received
    /// file against the declared hash when both are available.
    async fn complete(&self, sid: &str, path: Option<PathBuf>) {
        let check = {
            let Some(entry) = self.attempts.get(sid) else {
                debug!(%sid, "completion for a gone attempt");
                return;
            };
            let negotiator = entry.lock();
            match (negotiator.role(), path, negotiator.file().hash.clone()) {
                (TransferRole::Receiver, Some(path), Some(declared)) => {
                    Some((path, negotiator.file().hash_algo, declared))
                }
                _ => None,
            }
        };

        let verified = match check {
            Some((path, algo, declared)) => {
                let outcome = tokio::task::spawn_blocking(move || {
                    hash::verify_file_hash(&path, algo, &declared)
                })
                .await;
                match outcome {
                    Ok(Ok(matched)) => Some(matched),
                    Ok(Err(e)) => {
                        warn!(%sid, error = %e, "could not verify received file");
                        None
                    }
                    Err(e) => {
                        warn!(%sid, error = %e, "verification task failed");
                        None
                    }
                }
            }
            None => None,
        };

        info!(%sid, verified = ?verified, "transfer completed");
        self.transport.stop(sid);
        if self
            .events
            .send(TransferEvent::Completed {
                sid: sid.to_string(),
                verified,
            })
            .is_err()
        {
            debug!(%sid, "transfer event receiver dropped");
        }
        self.forget(sid);
    }
}

impl SignalingHandler for TransferManager {
    fn handle_signaling(&self, stanza: &Stanza) -> bool {
        match stanza.iq_kind() {
            Some(kind @ (IqKind::Result | IqKind::Error)) => {
                return self.handle_reply(stanza, kind);
            }
            Some(IqKind::Set) => {}
            _ => return false,
        }

        let Some(envelope) = signaling::parse_envelope(stanza) else {
            return false;
        };
        match envelope.action {
            Action::SessionInitiate | Action::ContentAdd => self.handle_offer(stanza, &envelope),
            Action::SessionAccept => {
                let (security, candidates) = signaling::content_of(envelope.session)
                    .map(|content| {
                        let security = signaling::has_security(content);
                        let candidates = signaling::transport_of(content)
                            .map(|(_, t)| {
                                let owner = stanza
                                    .attr("from")
                                    .unwrap_or_default()
                                    .to_string();
                                signaling::parse_candidates(t, &owner)
                            })
                            .unwrap_or_default();
                        (security, candidates)
                    })
                    .unwrap_or((false, Vec::new()));
                self.drive_inbound(&envelope.sid, stanza, |n| {
                    n.on_accept_received(security, candidates)
                })
            }
            Action::SessionInfo => match signaling::parse_checksum(envelope.session) {
                Some((algo, hash)) => self.drive_inbound(&envelope.sid, stanza, |n| {
                    n.on_checksum_received(algo, hash)
                }),
                None => {
                    debug!(sid = %envelope.sid, "session-info without checksum, acknowledging");
                    if let Err(e) = self.channel.send(stanza.reply_result()) {
                        warn!(error = %e, "failed to acknowledge session-info");
                    }
                    true
                }
            },
            Action::TransportInfo => self.handle_transport_info(stanza, &envelope),
            Action::TransportReplace => {
                self.drive_inbound(&envelope.sid, stanza, |n| n.on_transport_replace_received())
            }
            Action::TransportAccept => {
                self.drive_inbound(&envelope.sid, stanza, |n| n.on_transport_accept_received())
            }
            Action::SessionTerminate => {
                self.drive_inbound(&envelope.sid, stanza, |n| n.on_terminate_received())
            }
        }
    }
}

/// State copied out of a locked negotiator so actions can run without
/// holding its lock.
struct AttemptSnapshot {
    file: FileDescriptor,
    role: TransferRole,
}

fn snapshot(negotiator: &TransferNegotiator) -> AttemptSnapshot {
    AttemptSnapshot {
        file: negotiator.file().clone(),
        role: negotiator.role(),
    }
}
