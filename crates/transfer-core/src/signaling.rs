//! Builders and parsers for the transfer signaling vocabulary.
//!
//! Transfer negotiation rides inside iq stanzas: a `<session>` envelope
//! carrying an action, the transfer session id, and action-specific
//! payload (file description, transport candidates, checksums). This
//! module is the only place that knows those shapes; the negotiator deals
//! in typed inputs and the driver maps between the two.

use std::str::FromStr;

use uuid::Uuid;

use peerwave_stanza_core::{ns, PeerAddr, Stanza};

use crate::candidate::TransportCandidate;
use crate::errors::{Result, TransferError};
use crate::file::{FileDescriptor, HashAlgo};
use crate::transport::TransportKind;

/// Actions of the signaling envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SessionInitiate,
    ContentAdd,
    SessionAccept,
    SessionInfo,
    SessionTerminate,
    TransportInfo,
    TransportReplace,
    TransportAccept,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::SessionInitiate => "session-initiate",
            Action::ContentAdd => "content-add",
            Action::SessionAccept => "session-accept",
            Action::SessionInfo => "session-info",
            Action::SessionTerminate => "session-terminate",
            Action::TransportInfo => "transport-info",
            Action::TransportReplace => "transport-replace",
            Action::TransportAccept => "transport-accept",
        }
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "session-initiate" => Ok(Action::SessionInitiate),
            "content-add" => Ok(Action::ContentAdd),
            "session-accept" => Ok(Action::SessionAccept),
            "session-info" => Ok(Action::SessionInfo),
            "session-terminate" => Ok(Action::SessionTerminate),
            "transport-info" => Ok(Action::TransportInfo),
            "transport-replace" => Ok(Action::TransportReplace),
            "transport-accept" => Ok(Action::TransportAccept),
            _ => Err(()),
        }
    }
}

/// A parsed signaling envelope: action, transfer session id, and the
/// `<session>` element itself for payload access.
pub struct Envelope<'a> {
    pub action: Action,
    pub sid: String,
    pub session: &'a Stanza,
}

/// Recognize a signaling iq. `None` means the stanza is not ours.
pub fn parse_envelope(iq: &Stanza) -> Option<Envelope<'_>> {
    let session = iq.child_ns("session", ns::SIGNALING)?;
    let action = session.attr("action")?.parse().ok()?;
    let sid = session.attr("sid")?.to_string();
    Some(Envelope {
        action,
        sid,
        session,
    })
}

fn base_iq(local: &PeerAddr, peer: &PeerAddr) -> Stanza {
    Stanza::new("iq")
        .with_attr("type", "set")
        .with_attr("id", Uuid::new_v4().to_string())
        .with_attr("from", local.to_string())
        .with_attr("to", peer.to_string())
}

fn session_el(action: Action, sid: &str, initiator: &str) -> Stanza {
    Stanza::new_ns("session", ns::SIGNALING)
        .with_attr("action", action.as_str())
        .with_attr("sid", sid)
        .with_attr("initiator", initiator)
}

fn transport_ns(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Relay => ns::RELAY_TRANSPORT,
        TransportKind::InBand => ns::INBAND_TRANSPORT,
    }
}

fn transport_el(
    kind: TransportKind,
    sid: &str,
    candidates: &[TransportCandidate],
    dst_digest: Option<&str>,
) -> Stanza {
    let mut transport = Stanza::new_ns("transport", transport_ns(kind)).with_attr("sid", sid);
    if let Some(digest) = dst_digest {
        transport.set_attr("dstaddr", digest);
    }
    for cand in candidates {
        transport.add_child(
            Stanza::new("candidate")
                .with_attr("cid", &cand.cid)
                .with_attr("host", &cand.host)
                .with_attr("port", cand.port.to_string())
                .with_attr("priority", cand.priority.to_string()),
        );
    }
    transport
}

fn file_el(file: &FileDescriptor) -> Stanza {
    let mut el = Stanza::new("file")
        .with_child(Stanza::new("name").with_text(&file.name))
        .with_child(Stanza::new("size").with_text(file.size.to_string()));
    if let Some(hash) = &file.hash {
        el.add_child(
            Stanza::new_ns("hash", ns::HASHES)
                .with_attr("algo", file.hash_algo.as_str())
                .with_text(hash),
        );
    }
    el
}

fn description_el(file: &FileDescriptor) -> Stanza {
    Stanza::new_ns("description", ns::FILE_TRANSFER).with_child(file_el(file))
}

fn content_el(initiator: &str, file_name: &str) -> Stanza {
    Stanza::new("content")
        .with_attr("creator", "initiator")
        .with_attr("name", file_name)
        .with_attr("initiator", initiator)
}

/// `session-initiate`: the full transfer offer.
pub fn offer(
    local: &PeerAddr,
    peer: &PeerAddr,
    sid: &str,
    file: &FileDescriptor,
    kind: TransportKind,
    candidates: &[TransportCandidate],
    use_security: bool,
    dst_digest: Option<&str>,
) -> Stanza {
    let mut content = content_el(&local.to_string(), &file.name)
        .with_child(description_el(file))
        .with_child(transport_el(kind, sid, candidates, dst_digest));
    if use_security {
        content.add_child(Stanza::new_ns("security", ns::SECURITY));
    }
    base_iq(local, peer).with_child(
        session_el(Action::SessionInitiate, sid, &local.to_string()).with_child(content),
    )
}

/// `session-accept`: answer to an offer, carrying our candidates.
pub fn accept(
    local: &PeerAddr,
    peer: &PeerAddr,
    sid: &str,
    initiator: &str,
    file: &FileDescriptor,
    kind: TransportKind,
    candidates: &[TransportCandidate],
    use_security: bool,
) -> Stanza {
    let mut content = content_el(initiator, &file.name)
        .with_child(description_el(file))
        .with_child(transport_el(kind, sid, candidates, None));
    if use_security {
        content.add_child(Stanza::new_ns("security", ns::SECURITY));
    }
    base_iq(local, peer)
        .with_child(session_el(Action::SessionAccept, sid, initiator).with_child(content))
}

fn transport_info(
    local: &PeerAddr,
    peer: &PeerAddr,
    sid: &str,
    kind: TransportKind,
    payload: Stanza,
) -> Stanza {
    let transport = Stanza::new_ns("transport", transport_ns(kind))
        .with_attr("sid", sid)
        .with_child(payload);
    base_iq(local, peer).with_child(
        session_el(Action::TransportInfo, sid, &local.to_string())
            .with_child(Stanza::new("content").with_child(transport)),
    )
}

/// `transport-info` nominating the candidate we connected to.
pub fn candidate_used(
    local: &PeerAddr,
    peer: &PeerAddr,
    sid: &str,
    kind: TransportKind,
    cid: &str,
) -> Stanza {
    transport_info(
        local,
        peer,
        sid,
        kind,
        Stanza::new("candidate-used").with_attr("cid", cid),
    )
}

/// `transport-info` reporting that none of the peer's candidates worked.
pub fn candidate_error(local: &PeerAddr, peer: &PeerAddr, sid: &str, kind: TransportKind) -> Stanza {
    transport_info(local, peer, sid, kind, Stanza::new("candidate-error"))
}

/// `session-info` carrying the integrity checksum computed after the offer.
pub fn checksum(
    local: &PeerAddr,
    peer: &PeerAddr,
    sid: &str,
    algo: HashAlgo,
    hash: &str,
) -> Stanza {
    let checksum = Stanza::new_ns("checksum", ns::FILE_TRANSFER).with_child(
        Stanza::new("file").with_child(
            Stanza::new_ns("hash", ns::HASHES)
                .with_attr("algo", algo.as_str())
                .with_text(hash),
        ),
    );
    base_iq(local, peer)
        .with_child(session_el(Action::SessionInfo, sid, &local.to_string()).with_child(checksum))
}

/// `transport-replace`: initiator proposes falling back to in-band.
pub fn transport_replace(local: &PeerAddr, peer: &PeerAddr, sid: &str) -> Stanza {
    base_iq(local, peer).with_child(
        session_el(Action::TransportReplace, sid, &local.to_string()).with_child(
            Stanza::new("content").with_child(transport_el(TransportKind::InBand, sid, &[], None)),
        ),
    )
}

/// `transport-accept`: responder agrees to the fallback transport.
pub fn transport_accept(local: &PeerAddr, peer: &PeerAddr, sid: &str, initiator: &str) -> Stanza {
    base_iq(local, peer).with_child(
        session_el(Action::TransportAccept, sid, initiator).with_child(
            Stanza::new("content").with_child(transport_el(TransportKind::InBand, sid, &[], None)),
        ),
    )
}

/// `session-terminate` with a machine-readable reason element.
pub fn terminate(local: &PeerAddr, peer: &PeerAddr, sid: &str, reason: &str) -> Stanza {
    base_iq(local, peer).with_child(
        session_el(Action::SessionTerminate, sid, &local.to_string())
            .with_child(Stanza::new("reason").with_child(Stanza::new(reason))),
    )
}

/// The `<content>` element of an envelope, when present.
pub fn content_of<'a>(session: &'a Stanza) -> Option<&'a Stanza> {
    session.child("content")
}

/// The `<transport>` element and its kind, from a `<content>` payload.
pub fn transport_of(content: &Stanza) -> Option<(TransportKind, &Stanza)> {
    let transport = content.child("transport")?;
    match transport.namespace.as_deref() {
        Some(ns::RELAY_TRANSPORT) => Some((TransportKind::Relay, transport)),
        Some(ns::INBAND_TRANSPORT) => Some((TransportKind::InBand, transport)),
        _ => None,
    }
}

/// Parse the declared file metadata from a `<content>` payload.
pub fn parse_file(content: &Stanza) -> Result<FileDescriptor> {
    let description = content
        .child_ns("description", ns::FILE_TRANSFER)
        .ok_or_else(|| TransferError::Signaling("offer without description".into()))?;
    let file = description
        .child("file")
        .ok_or_else(|| TransferError::Signaling("description without file".into()))?;
    let name = file
        .child_text("name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| TransferError::Signaling("file without name".into()))?;
    let size = file
        .child_text("size")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransferError::Signaling("file without size".into()))?;

    let mut descriptor = match file
        .child_ns("hash", ns::HASHES)
        .and_then(|h| h.attr("algo"))
        .and_then(|a| HashAlgo::parse(a).ok())
    {
        Some(algo) => FileDescriptor::inbound(name, size, algo),
        None => FileDescriptor::inbound(name, size, HashAlgo::Sha256),
    };
    descriptor.hash = file
        .child_ns("hash", ns::HASHES)
        .map(|h| h.text().to_string())
        .filter(|h| !h.is_empty());
    Ok(descriptor)
}

/// Parse the candidates a `<transport>` element declares, stamping the
/// declaring party as owner.
pub fn parse_candidates(transport: &Stanza, owner: &str) -> Vec<TransportCandidate> {
    transport
        .children
        .iter()
        .filter(|c| c.name == "candidate")
        .filter_map(|c| {
            let cid = c.attr("cid")?;
            let host = c.attr("host")?;
            let port = c.attr("port")?.parse().ok()?;
            let priority = c.attr("priority").and_then(|p| p.parse().ok()).unwrap_or(0);
            Some(TransportCandidate::new(cid, host, port, priority).with_owner(owner))
        })
        .collect()
}

/// Parse the checksum a `session-info` carries, if any.
pub fn parse_checksum(session: &Stanza) -> Option<(HashAlgo, String)> {
    let hash = session
        .child_ns("checksum", ns::FILE_TRANSFER)?
        .child("file")?
        .child_ns("hash", ns::HASHES)?;
    let algo = HashAlgo::parse(hash.attr("algo")?).ok()?;
    let value = hash.text();
    if value.is_empty() {
        return None;
    }
    Some((algo, value.to_string()))
}

/// Whether a `<content>` payload carries the security precondition.
pub fn has_security(content: &Stanza) -> bool {
    content.child_ns("security", ns::SECURITY).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn addrs() -> (PeerAddr, PeerAddr) {
        (
            "alice@example.org/desk".parse().unwrap(),
            "bob@example.org/road".parse().unwrap(),
        )
    }

    #[test]
    fn offer_round_trips_through_the_parsers() {
        let (alice, bob) = addrs();
        let mut file = FileDescriptor::outbound("notes.txt", PathBuf::from("/tmp/notes.txt"), 100);
        file.hash = Some("aa".repeat(32));
        let cands = vec![TransportCandidate::new("c1", "relay.example.org", 7777, 80)];

        let iq = offer(
            &alice,
            &bob,
            "sid-1",
            &file,
            TransportKind::Relay,
            &cands,
            true,
            None,
        );
        let env = parse_envelope(&iq).expect("envelope");
        assert_eq!(env.action, Action::SessionInitiate);
        assert_eq!(env.sid, "sid-1");

        let content = content_of(env.session).unwrap();
        assert!(has_security(content));

        let parsed = parse_file(content).unwrap();
        assert_eq!(parsed.name, "notes.txt");
        assert_eq!(parsed.size, 100);
        assert_eq!(parsed.hash.as_deref(), Some("aa".repeat(32).as_str()));

        let (kind, transport) = transport_of(content).unwrap();
        assert_eq!(kind, TransportKind::Relay);
        let parsed_cands = parse_candidates(transport, "alice@example.org/desk");
        assert_eq!(parsed_cands.len(), 1);
        assert_eq!(parsed_cands[0].priority, 80);
        assert_eq!(parsed_cands[0].owner, "alice@example.org/desk");
    }

    #[test]
    fn non_signaling_iq_is_not_recognized() {
        let iq = Stanza::new("iq")
            .with_attr("type", "get")
            .with_child(Stanza::new("query"));
        assert!(parse_envelope(&iq).is_none());
    }

    #[test]
    fn checksum_parses_back() {
        let (alice, bob) = addrs();
        let iq = checksum(&alice, &bob, "sid-1", HashAlgo::Sha256, "beef");
        let env = parse_envelope(&iq).unwrap();
        assert_eq!(env.action, Action::SessionInfo);
        let (algo, value) = parse_checksum(env.session).unwrap();
        assert_eq!(algo, HashAlgo::Sha256);
        assert_eq!(value, "beef");
    }

    #[test]
    fn malformed_offer_is_an_error_not_a_panic() {
        let content = Stanza::new("content");
        assert!(parse_file(&content).is_err());

        let content = Stanza::new("content").with_child(
            Stanza::new_ns("description", ns::FILE_TRANSFER)
                .with_child(Stanza::new("file").with_child(Stanza::new("name").with_text("x"))),
        );
        assert!(parse_file(&content).is_err(), "missing size must fail");
    }
}
