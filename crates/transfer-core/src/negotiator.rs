//! The per-attempt transfer negotiation state machine.
//!
//! One [`TransferNegotiator`] exists per file-transfer attempt. It is a
//! pure state machine: inputs are typed signaling events fed in arrival
//! order by the driver, outputs are [`NegotiatorAction`] lists the driver
//! executes. The negotiator performs no I/O itself, which keeps every
//! transition unit-testable without a transport or a network.
//!
//! The candidate phase is deliberately order-insensitive: "our outcome"
//! and "the peer's outcome" may land in either order and both interleavings
//! reach the same terminal state and chosen candidate (see
//! [`crate::candidate::choose`]).

use std::path::PathBuf;
use std::sync::Weak;

use tracing::{debug, info, warn};

use peerwave_session_core::Session;
use peerwave_stanza_core::{PeerAddr, Stanza};

use crate::candidate::{choose, Nomination, TransportCandidate};
use crate::events::TransferEvent;
use crate::file::{FileDescriptor, HashAlgo, TransferRole};
use crate::signaling;
use crate::state::TransferState;
use crate::transport::TransportKind;

/// Instructions the driver executes after a transition.
///
/// Actions are returned in the order they must run. `SendStanza` carries a
/// fully built protocol unit; `Ack` asks the driver to acknowledge the
/// stanza currently being processed.
#[derive(Debug)]
pub enum NegotiatorAction {
    /// Send this stanza over the signaling channel, tracking its id so the
    /// peer's acknowledgement routes back to this attempt.
    SendStanza(Stanza),
    /// Acknowledge the inbound stanza being processed (generic iq result).
    Ack,
    /// Open the local listener for this attempt.
    StartListener { port: u16, auth_token: String },
    /// Try outbound connections to these candidate hosts.
    ConnectToHosts { candidates: Vec<TransportCandidate> },
    /// Negotiation settled; start moving bytes. `over` names the
    /// authoritative relay candidate, `None` for the in-band channel.
    StartStreaming {
        role: TransferRole,
        over: Option<TransportCandidate>,
    },
    /// Hash the local file off the signaling task.
    ComputeHash { path: PathBuf, algo: HashAlgo },
    /// Tear down any listener or connection held for this attempt.
    StopTransport,
    /// Publish an application-visible transfer event.
    Publish(TransferEvent),
}

/// Why an attempt ended, for the terminate signal and the published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Cancelled,
    FailedTransport,
    MediaError,
}

impl EndReason {
    fn wire_name(&self) -> &'static str {
        match self {
            EndReason::Cancelled => "cancel",
            EndReason::FailedTransport => "failed-transport",
            EndReason::MediaError => "media-error",
        }
    }
}

/// State machine for one file-transfer attempt.
pub struct TransferNegotiator {
    sid: String,
    local: PeerAddr,
    peer: PeerAddr,
    /// Full address of the original initiator, echoed in every envelope.
    initiator: String,
    role: TransferRole,
    we_initiated: bool,
    state: TransferState,
    transport: TransportKind,
    file: FileDescriptor,
    use_security: bool,
    /// Destination digest override used when the peer is a room occupant.
    dst_digest: Option<String>,
    listener_port: u16,
    /// Candidates we declared to the peer.
    local_candidates: Vec<TransportCandidate>,
    /// Candidates the peer declared to us.
    remote_candidates: Vec<TransportCandidate>,
    our_cand: Nomination,
    peer_cand: Nomination,
    /// Bytes reported moved so far; updated by the driver from transport
    /// progress signals.
    transferred: u64,
    terminated: bool,
    /// Back-reference to the owning conversational session.
    session: Weak<Session>,
}

impl TransferNegotiator {
    /// Attempt we initiate: we are the sender and the original initiator.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        sid: impl Into<String>,
        local: PeerAddr,
        peer: PeerAddr,
        file: FileDescriptor,
        transport: TransportKind,
        use_security: bool,
        listener_port: u16,
        session: Weak<Session>,
    ) -> Self {
        let local_str = local.to_string();
        Self {
            sid: sid.into(),
            local,
            peer,
            initiator: local_str,
            role: TransferRole::Sender,
            we_initiated: true,
            state: TransferState::NotStarted,
            transport,
            file,
            use_security,
            dst_digest: None,
            listener_port,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            our_cand: Nomination::Undecided,
            peer_cand: Nomination::Undecided,
            transferred: 0,
            terminated: false,
            session,
        }
    }

    /// Attempt offered to us by a remote peer: we are the receiver.
    #[allow(clippy::too_many_arguments)]
    pub fn inbound(
        sid: impl Into<String>,
        local: PeerAddr,
        peer: PeerAddr,
        initiator: impl Into<String>,
        file: FileDescriptor,
        transport: TransportKind,
        remote_candidates: Vec<TransportCandidate>,
        use_security: bool,
        listener_port: u16,
        session: Weak<Session>,
    ) -> Self {
        Self {
            sid: sid.into(),
            local,
            peer,
            initiator: initiator.into(),
            role: TransferRole::Receiver,
            we_initiated: false,
            state: TransferState::NotStarted,
            transport,
            file,
            use_security,
            dst_digest: None,
            listener_port,
            local_candidates: Vec::new(),
            remote_candidates,
            our_cand: Nomination::Undecided,
            peer_cand: Nomination::Undecided,
            transferred: 0,
            terminated: false,
            session,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn role(&self) -> TransferRole {
        self.role
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn security_enforced(&self) -> bool {
        self.use_security
    }

    /// Owning session, while it is still alive.
    pub fn session(&self) -> Option<std::sync::Arc<Session>> {
        self.session.upgrade()
    }

    /// Replace the destination digest with a room-derived one.
    pub fn set_dst_digest(&mut self, digest: String) {
        self.dst_digest = Some(digest);
    }

    pub fn add_transferred(&mut self, bytes: u64) {
        self.transferred += bytes;
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Build and queue the initial offer. When the file's hash is not yet
    /// known it is computed off the signaling task and sent as a follow-up.
    pub fn start(&mut self, local_candidates: Vec<TransportCandidate>) -> Vec<NegotiatorAction> {
        self.local_candidates = local_candidates;
        let mut actions = vec![NegotiatorAction::SendStanza(signaling::offer(
            &self.local,
            &self.peer,
            &self.sid,
            &self.file,
            self.transport,
            &self.local_candidates,
            self.use_security,
            self.dst_digest.as_deref(),
        ))];
        if self.file.hash.is_none() {
            if let Some(path) = self.file.path.clone() {
                actions.push(NegotiatorAction::ComputeHash {
                    path,
                    algo: self.file.hash_algo,
                });
            }
        }
        info!(sid = %self.sid, peer = %self.peer, "transfer offer queued");
        actions
    }

    /// A remote offer created this attempt: open our listener and surface
    /// the request to the application.
    pub fn on_offer_received(&mut self, auth_token: String) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        self.state = TransferState::Initialized;
        info!(sid = %self.sid, peer = %self.peer, file = %self.file.name, "transfer requested");
        vec![
            NegotiatorAction::Ack,
            NegotiatorAction::StartListener {
                port: self.listener_port,
                auth_token,
            },
            NegotiatorAction::Publish(TransferEvent::Requested {
                sid: self.sid.clone(),
                peer: self.peer.to_string(),
                file: self.file.clone(),
            }),
        ]
    }

    /// The off-task hash finished; attach it via a follow-up checksum.
    pub fn on_hash_ready(&mut self, hash: String) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        self.file.hash = Some(hash.clone());
        vec![NegotiatorAction::SendStanza(signaling::checksum(
            &self.local,
            &self.peer,
            &self.sid,
            self.file.hash_algo,
            &hash,
        ))]
    }

    /// The peer sent its checksum for the file we are receiving.
    pub fn on_checksum_received(&mut self, algo: HashAlgo, hash: String) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        debug!(sid = %self.sid, algo = algo.as_str(), "checksum received");
        self.file.hash_algo = algo;
        self.file.hash = Some(hash);
        vec![NegotiatorAction::Ack]
    }

    /// The application accepted an inbound offer.
    pub fn accept(&mut self, local_candidates: Vec<TransportCandidate>) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        self.local_candidates = local_candidates;
        let mut actions = vec![NegotiatorAction::SendStanza(signaling::accept(
            &self.local,
            &self.peer,
            &self.sid,
            &self.initiator,
            &self.file,
            self.transport,
            &self.local_candidates,
            self.use_security,
        ))];
        match self.transport {
            TransportKind::Relay => {
                actions.push(NegotiatorAction::ConnectToHosts {
                    candidates: self.remote_candidates.clone(),
                });
            }
            // No candidate phase in-band: the accept settles it.
            TransportKind::InBand => actions.extend(self.enter_transferring()),
        }
        actions
    }

    /// The peer accepted our offer.
    pub fn on_accept_received(
        &mut self,
        security_present: bool,
        candidates: Vec<TransportCandidate>,
    ) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        if self.use_security && !security_present {
            // Degrade rather than fail when the peer cannot do security.
            warn!(sid = %self.sid, "peer accept omits security element, disabling enforcement");
            self.use_security = false;
        }
        if self.state == TransferState::TransportReplace {
            // Replacement path bypasses the candidate exchange entirely.
            let mut actions = vec![NegotiatorAction::Ack];
            actions.extend(self.enter_transferring());
            return actions;
        }
        self.remote_candidates = candidates;
        let mut actions = vec![NegotiatorAction::Ack];
        match self.transport {
            TransportKind::Relay => actions.push(NegotiatorAction::ConnectToHosts {
                candidates: self.remote_candidates.clone(),
            }),
            TransportKind::InBand => actions.extend(self.enter_transferring()),
        }
        actions
    }

    /// An outbound connection to one of the peer's candidates succeeded.
    pub fn on_candidate_connected(
        &mut self,
        candidate: TransportCandidate,
    ) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        debug!(sid = %self.sid, cid = %candidate.cid, "candidate connected");
        let stanza = signaling::candidate_used(
            &self.local,
            &self.peer,
            &self.sid,
            self.transport,
            &candidate.cid,
        );
        self.our_cand = Nomination::Candidate(candidate);
        self.advance_after_our_outcome();
        vec![NegotiatorAction::SendStanza(stanza)]
    }

    /// Every outbound connection attempt failed: our outcome is "nothing".
    pub fn on_candidate_failed(&mut self) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        debug!(sid = %self.sid, "all candidate connections failed");
        self.our_cand = Nomination::Nothing;
        self.advance_after_our_outcome();
        vec![NegotiatorAction::SendStanza(signaling::candidate_error(
            &self.local,
            &self.peer,
            &self.sid,
            self.transport,
        ))]
    }

    fn advance_after_our_outcome(&mut self) {
        self.state = if self.state == TransferState::CandReceived {
            TransferState::CandSentAndReceived
        } else {
            TransferState::CandSent
        };
    }

    /// The peer reported candidate-error: it nominated nothing.
    pub fn on_peer_candidate_error(&mut self) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        self.peer_cand = Nomination::Nothing;
        if self.state == TransferState::CandSent {
            if self.our_cand.is_nothing() {
                // Neither side has a viable candidate. Only the initiator
                // may propose a replacement; the responder stays put until
                // the initiator acts.
                if !self.we_initiated {
                    return Vec::new();
                }
                return self.propose_transport_replace();
            }
            let mut actions = vec![NegotiatorAction::Ack];
            actions.extend(self.enter_transferring());
            return actions;
        }
        self.state = TransferState::CandReceived;
        Vec::new()
    }

    /// The peer nominated one of our declared candidates.
    pub fn on_peer_candidate_used(&mut self, cid: &str) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        let nominated = self
            .local_candidates
            .iter()
            .find(|c| c.cid == cid)
            .cloned()
            .unwrap_or_else(|| {
                warn!(sid = %self.sid, %cid, "peer nominated an unknown candidate id");
                TransportCandidate::new(cid, "", 0, 0)
            });
        self.peer_cand = Nomination::Candidate(nominated);
        if self.state == TransferState::CandSent {
            self.state = TransferState::CandSentAndReceived;
            let mut actions = vec![NegotiatorAction::Ack];
            actions.extend(self.enter_transferring());
            return actions;
        }
        // Our own outcome is still pending; no acknowledgement yet.
        self.state = TransferState::CandReceived;
        Vec::new()
    }

    /// The peer announced the fallback channel is fully established.
    pub fn on_activated(&mut self) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        self.state = TransferState::Transferring;
        info!(sid = %self.sid, "in-band channel activated");
        vec![
            NegotiatorAction::StartStreaming {
                role: self.role,
                over: None,
            },
            NegotiatorAction::Publish(TransferEvent::Started {
                sid: self.sid.clone(),
            }),
        ]
    }

    /// Generic acknowledgement for a stanza we sent on this attempt.
    pub fn on_iq_result(&mut self) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        match self.state {
            TransferState::NotStarted => {
                self.state = TransferState::Initialized;
                if self.we_initiated {
                    // Our offer is acknowledged; open the listener backing
                    // the candidates we declared.
                    let token = crate::hash::auth_token(
                        &self.sid,
                        &self.initiator,
                        &self.peer.to_string(),
                    );
                    return vec![NegotiatorAction::StartListener {
                        port: self.listener_port,
                        auth_token: token,
                    }];
                }
                Vec::new()
            }
            TransferState::CandSentAndReceived => {
                if self.our_cand.is_nothing() && self.peer_cand.is_nothing() {
                    if !self.we_initiated {
                        return Vec::new();
                    }
                    return self.propose_transport_replace();
                }
                self.enter_transferring()
            }
            _ => Vec::new(),
        }
    }

    /// A stanza we sent on this attempt came back as an error.
    pub fn on_iq_error(&mut self, code: Option<&str>) -> Vec<NegotiatorAction> {
        warn!(sid = %self.sid, code = code.unwrap_or("none"), "signaling error on transfer attempt");
        self.end(EndReason::MediaError, false)
    }

    fn propose_transport_replace(&mut self) -> Vec<NegotiatorAction> {
        self.state = TransferState::TransportReplace;
        self.transport = TransportKind::InBand;
        info!(sid = %self.sid, "proposing in-band transport replacement");
        vec![
            NegotiatorAction::SendStanza(signaling::transport_replace(
                &self.local,
                &self.peer,
                &self.sid,
            )),
            NegotiatorAction::Publish(TransferEvent::TransportReplaced {
                sid: self.sid.clone(),
            }),
        ]
    }

    /// The initiator asked to replace the transport with the fallback.
    pub fn on_transport_replace_received(&mut self) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        self.transport = TransportKind::InBand;
        self.our_cand = Nomination::Nothing;
        self.peer_cand = Nomination::Nothing;
        let mut actions = vec![
            NegotiatorAction::Ack,
            NegotiatorAction::SendStanza(signaling::transport_accept(
                &self.local,
                &self.peer,
                &self.sid,
                &self.initiator,
            )),
            NegotiatorAction::Publish(TransferEvent::TransportReplaced {
                sid: self.sid.clone(),
            }),
        ];
        actions.extend(self.enter_transferring());
        actions
    }

    /// The peer agreed to our transport replacement.
    pub fn on_transport_accept_received(&mut self) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        if self.state != TransferState::TransportReplace {
            debug!(sid = %self.sid, state = %self.state, "unexpected transport-accept ignored");
            return vec![NegotiatorAction::Ack];
        }
        let mut actions = vec![NegotiatorAction::Ack];
        actions.extend(self.enter_transferring());
        actions
    }

    /// Local cancellation.
    pub fn cancel(&mut self) -> Vec<NegotiatorAction> {
        self.end(EndReason::Cancelled, true)
    }

    /// Irrecoverable local failure.
    pub fn fail(&mut self, reason: &str) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        warn!(sid = %self.sid, %reason, "transfer attempt failed");
        vec![
            NegotiatorAction::SendStanza(signaling::terminate(
                &self.local,
                &self.peer,
                &self.sid,
                EndReason::FailedTransport.wire_name(),
            )),
            NegotiatorAction::StopTransport,
            NegotiatorAction::Publish(TransferEvent::Failed {
                sid: self.sid.clone(),
                reason: reason.to_string(),
            }),
        ]
    }

    /// The peer terminated the attempt.
    pub fn on_terminate_received(&mut self) -> Vec<NegotiatorAction> {
        if self.terminated {
            return vec![NegotiatorAction::Ack];
        }
        self.terminated = true;
        info!(sid = %self.sid, "peer terminated transfer");
        vec![
            NegotiatorAction::Ack,
            NegotiatorAction::StopTransport,
            NegotiatorAction::Publish(TransferEvent::Cancelled {
                sid: self.sid.clone(),
            }),
        ]
    }

    fn end(&mut self, reason: EndReason, notify_peer: bool) -> Vec<NegotiatorAction> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        let mut actions = Vec::new();
        if notify_peer {
            actions.push(NegotiatorAction::SendStanza(signaling::terminate(
                &self.local,
                &self.peer,
                &self.sid,
                reason.wire_name(),
            )));
        }
        actions.push(NegotiatorAction::StopTransport);
        actions.push(NegotiatorAction::Publish(match reason {
            EndReason::Cancelled => TransferEvent::Cancelled {
                sid: self.sid.clone(),
            },
            EndReason::FailedTransport | EndReason::MediaError => TransferEvent::Failed {
                sid: self.sid.clone(),
                reason: reason.wire_name().to_string(),
            },
        }));
        actions
    }

    /// Negotiation settled. Pick the authoritative candidate and hand off
    /// to the transport subsystem.
    fn enter_transferring(&mut self) -> Vec<NegotiatorAction> {
        self.state = TransferState::Transferring;
        let over = match self.transport {
            TransportKind::Relay => {
                choose(&self.our_cand, &self.peer_cand, self.we_initiated)
                    .candidate()
                    .cloned()
            }
            TransportKind::InBand => None,
        };
        info!(
            sid = %self.sid,
            transport = ?self.transport,
            candidate = over.as_ref().map(|c| c.cid.as_str()).unwrap_or("none"),
            "transfer negotiation settled"
        );
        vec![
            NegotiatorAction::StartStreaming {
                role: self.role,
                over,
            },
            NegotiatorAction::Publish(TransferEvent::Started {
                sid: self.sid.clone(),
            }),
        ]
    }
}
