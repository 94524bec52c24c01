//! End-to-end negotiation scenarios driven through the transfer manager:
//! candidate exchange in both arrival orders, the tie-break, transport
//! fallback, in-band shortcut, completion verification and termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use peerwave_session_core::dispatcher::NoRooms;
use peerwave_session_core::{SessionRegistry, SignalingChannel, SignalingHandler};
use peerwave_stanza_core::{ns, PeerAddr, Stanza};
use peerwave_transfer_core::{
    signaling, ByteStreamTransport, FileDescriptor, HashAlgo, ListenerHandle, TransferConfig,
    TransferEvent, TransferManager, TransferRole, TransferSignal, TransportCandidate,
    TransportKind,
};

#[derive(Default)]
struct MockChannel {
    sent: Mutex<Vec<Stanza>>,
}

impl MockChannel {
    fn sent(&self) -> Vec<Stanza> {
        self.sent.lock().clone()
    }

    /// Sent stanzas carrying a signaling envelope with this action.
    fn sent_actions(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| s.child_ns("session", ns::SIGNALING))
            .filter_map(|s| s.attr("action").map(str::to_string))
            .collect()
    }

}

impl SignalingChannel for MockChannel {
    fn is_connected(&self) -> bool {
        true
    }

    fn send(&self, stanza: Stanza) -> peerwave_session_core::Result<()> {
        self.sent.lock().push(stanza);
        Ok(())
    }
}

#[derive(Default)]
struct MockTransport {
    listeners: Mutex<Vec<(String, u16)>>,
    connects: Mutex<Vec<(String, Vec<TransportCandidate>)>>,
    streams: Mutex<Vec<(String, TransferRole, Option<TransportCandidate>)>>,
    stopped: Mutex<Vec<String>>,
    fail_listener: AtomicBool,
}

impl ByteStreamTransport for MockTransport {
    fn local_candidates(&self, _sid: &str) -> Vec<TransportCandidate> {
        vec![TransportCandidate::new("local-1", "10.0.0.5", 28011, 80)]
    }

    fn start_listener(
        &self,
        sid: &str,
        port: u16,
        _auth_token: &str,
        _descriptor: &FileDescriptor,
        _role: TransferRole,
    ) -> peerwave_transfer_core::Result<ListenerHandle> {
        if self.fail_listener.load(Ordering::Relaxed) {
            return Err(peerwave_transfer_core::TransferError::ListenerFailed(
                "port in use".into(),
            ));
        }
        self.listeners.lock().push((sid.to_string(), port));
        Ok(ListenerHandle {
            port,
            auth_token: String::new(),
        })
    }

    fn connect_to_hosts(
        &self,
        sid: &str,
        candidates: Vec<TransportCandidate>,
        _signals: mpsc::UnboundedSender<TransferSignal>,
    ) {
        self.connects.lock().push((sid.to_string(), candidates));
    }

    fn send_file(
        &self,
        sid: &str,
        _descriptor: &FileDescriptor,
        role: TransferRole,
        over: Option<TransportCandidate>,
        _signals: mpsc::UnboundedSender<TransferSignal>,
    ) {
        self.streams.lock().push((sid.to_string(), role, over));
    }

    fn stop(&self, sid: &str) {
        self.stopped.lock().push(sid.to_string());
    }
}

struct Fixture {
    manager: Arc<TransferManager>,
    channel: Arc<MockChannel>,
    transport: Arc<MockTransport>,
    registry: Arc<SessionRegistry>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("peerwave_transfer_core=debug")
        .try_init();
}

fn fixture(local: &str) -> Fixture {
    init_tracing();
    let channel = Arc::new(MockChannel::default());
    let transport = Arc::new(MockTransport::default());
    let registry = Arc::new(SessionRegistry::new(Arc::new(NoRooms)));
    let (manager, events) = TransferManager::new(
        local.parse().unwrap(),
        TransferConfig::default(),
        channel.clone(),
        transport.clone(),
        Arc::new(NoRooms),
        registry.clone(),
    );
    tokio::spawn(manager.clone().run());
    Fixture {
        manager,
        channel,
        transport,
        registry,
        events,
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut out = Vec::new();
    while let Ok(e) = events.try_recv() {
        out.push(e);
    }
    out
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn iq_result(id: &str, from: &str) -> Stanza {
    Stanza::new("iq")
        .with_attr("type", "result")
        .with_attr("id", id)
        .with_attr("from", from)
}

const ALICE: &str = "alice@example.org/desk";
const BOB: &str = "bob@example.org/road";

fn addr(s: &str) -> PeerAddr {
    s.parse().unwrap()
}

fn relay_cand(cid: &str, priority: u32) -> TransportCandidate {
    TransportCandidate::new(cid, "relay.example.org", 7777, priority)
}

/// Drive an initiated (sender-side) attempt up to the point where both
/// sides are trying candidates.
fn initiate(f: &Fixture) -> String {
    let path = std::env::temp_dir().join(format!("peerwave-offer-{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"hello").unwrap();
    let session = f.registry.get_or_create(&addr(BOB), None);
    let sid = f
        .manager
        .offer_file(&session, path, "notes.txt", 5)
        .unwrap();

    // Peer acknowledges the offer; our listener opens.
    let offer_id = f.channel.sent()[0].id().unwrap().to_string();
    assert!(f.manager.handle_signaling(&iq_result(&offer_id, BOB)));
    assert_eq!(f.transport.listeners.lock().len(), 1);

    // Peer accepts with one candidate of its own.
    let accept = signaling::accept(
        &addr(BOB),
        &addr(ALICE),
        &sid,
        ALICE,
        &FileDescriptor::inbound("notes.txt", 100, HashAlgo::Sha256),
        TransportKind::Relay,
        &[relay_cand("bob-1", 80)],
        false,
    );
    assert!(f.manager.handle_signaling(&accept));
    assert_eq!(f.transport.connects.lock().len(), 1);
    sid
}

#[tokio::test]
async fn equal_priority_tie_goes_to_the_initiators_candidate() {
    let mut f = fixture(ALICE);
    let sid = initiate(&f);

    // Our connection to bob-1 succeeds (priority 80)...
    f.manager
        .signal_sender()
        .send(TransferSignal::CandidateConnected {
            sid: sid.clone(),
            candidate: relay_cand("bob-1", 80).with_owner(BOB),
        })
        .unwrap();
    let channel = f.channel.clone();
    wait_until(move || channel.sent_actions().iter().any(|a| a == "transport-info")).await;

    // ...and the peer nominates our candidate, also priority 80.
    let used = signaling::candidate_used(&addr(BOB), &addr(ALICE), &sid, TransportKind::Relay, "local-1");
    assert!(f.manager.handle_signaling(&used));

    let streams = f.transport.streams.lock().clone();
    assert_eq!(streams.len(), 1);
    let over = streams[0].2.as_ref().expect("a relay candidate was chosen");
    assert_eq!(over.cid, "bob-1", "initiator's nomination wins the tie");
    assert!(drain(&mut f.events)
        .iter()
        .any(|e| matches!(e, TransferEvent::Started { .. })));
}

#[tokio::test]
async fn both_sides_failing_makes_the_initiator_propose_fallback() {
    let mut f = fixture(ALICE);
    let sid = initiate(&f);

    f.manager
        .signal_sender()
        .send(TransferSignal::CandidateFailed { sid: sid.clone() })
        .unwrap();
    let channel = f.channel.clone();
    wait_until(move || channel.sent_actions().iter().any(|a| a == "transport-info")).await;

    let error = signaling::candidate_error(&addr(BOB), &addr(ALICE), &sid, TransportKind::Relay);
    assert!(f.manager.handle_signaling(&error));

    assert!(f
        .channel
        .sent_actions()
        .iter()
        .any(|a| a == "transport-replace"));
    assert!(drain(&mut f.events)
        .iter()
        .any(|e| matches!(e, TransferEvent::TransportReplaced { .. })));

    // The peer agrees; the transfer restarts over the in-band channel.
    let accept = signaling::transport_accept(&addr(BOB), &addr(ALICE), &sid, ALICE);
    assert!(f.manager.handle_signaling(&accept));
    let streams = f.transport.streams.lock().clone();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].2.is_none(), "in-band flow has no candidate");
}

#[tokio::test]
async fn non_initiator_stalls_when_both_sides_fail() {
    let mut f = fixture(BOB);
    // Alice offers us a file over the relay transport.
    let offer = signaling::offer(
        &addr(ALICE),
        &addr(BOB),
        "sid-stall",
        &FileDescriptor::inbound("notes.txt", 100, HashAlgo::Sha256),
        TransportKind::Relay,
        &[relay_cand("alice-1", 80)],
        false,
        None,
    );
    assert!(f.manager.handle_signaling(&offer));
    assert!(drain(&mut f.events)
        .iter()
        .any(|e| matches!(e, TransferEvent::Requested { .. })));

    f.manager.accept_transfer("sid-stall").unwrap();
    assert_eq!(f.transport.connects.lock().len(), 1);

    f.manager
        .signal_sender()
        .send(TransferSignal::CandidateFailed {
            sid: "sid-stall".into(),
        })
        .unwrap();
    let channel = f.channel.clone();
    wait_until(move || channel.sent_actions().iter().any(|a| a == "transport-info")).await;

    let error = signaling::candidate_error(&addr(ALICE), &addr(BOB), "sid-stall", TransportKind::Relay);
    assert!(f.manager.handle_signaling(&error));

    // The responder may not propose a replacement; it waits for the
    // initiator's decision.
    assert!(!f
        .channel
        .sent_actions()
        .iter()
        .any(|a| a == "transport-replace"));
    assert!(f.transport.streams.lock().is_empty());
    assert_eq!(f.manager.active_transfers(), 1);
}

#[tokio::test]
async fn in_band_offer_skips_the_candidate_phase() {
    let mut f = fixture(BOB);
    let offer = signaling::offer(
        &addr(ALICE),
        &addr(BOB),
        "sid-ib",
        &FileDescriptor::inbound("notes.txt", 100, HashAlgo::Sha256),
        TransportKind::InBand,
        &[],
        false,
        None,
    );
    assert!(f.manager.handle_signaling(&offer));
    f.manager.accept_transfer("sid-ib").unwrap();

    assert!(f.transport.connects.lock().is_empty());
    let streams = f.transport.streams.lock().clone();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].1, TransferRole::Receiver);
    assert!(streams[0].2.is_none());
    assert!(drain(&mut f.events)
        .iter()
        .any(|e| matches!(e, TransferEvent::Started { .. })));
}

#[tokio::test]
async fn completed_transfer_verifies_the_declared_hash() {
    let mut f = fixture(BOB);
    // Offer declares the sha-256 of "abc".
    let mut file = FileDescriptor::inbound("notes.txt", 3, HashAlgo::Sha256);
    file.hash = Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into());
    let offer = signaling::offer(
        &addr(ALICE),
        &addr(BOB),
        "sid-done",
        &file,
        TransportKind::InBand,
        &[],
        false,
        None,
    );
    assert!(f.manager.handle_signaling(&offer));
    f.manager.accept_transfer("sid-done").unwrap();

    let path = std::env::temp_dir().join(format!("peerwave-recv-{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"abc").unwrap();
    f.manager
        .signal_sender()
        .send(TransferSignal::IoCompleted {
            sid: "sid-done".into(),
            path: Some(path.clone()),
        })
        .unwrap();

    let manager = f.manager.clone();
    wait_until(move || manager.active_transfers() == 0).await;
    let events = drain(&mut f.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, TransferEvent::Completed { verified: Some(true), .. })));
    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn peer_termination_cancels_and_acknowledges() {
    let mut f = fixture(BOB);
    let offer = signaling::offer(
        &addr(ALICE),
        &addr(BOB),
        "sid-term",
        &FileDescriptor::inbound("notes.txt", 100, HashAlgo::Sha256),
        TransportKind::Relay,
        &[relay_cand("alice-1", 80)],
        false,
        None,
    );
    assert!(f.manager.handle_signaling(&offer));
    drain(&mut f.events);

    let terminate = signaling::terminate(&addr(ALICE), &addr(BOB), "sid-term", "cancel");
    assert!(f.manager.handle_signaling(&terminate));

    assert!(drain(&mut f.events)
        .iter()
        .any(|e| matches!(e, TransferEvent::Cancelled { .. })));
    assert_eq!(f.transport.stopped.lock().clone(), vec!["sid-term"]);
    assert_eq!(f.manager.active_transfers(), 0);
    // The terminate itself was acknowledged.
    let last = f.channel.sent();
    assert_eq!(last.last().unwrap().attr("type"), Some("result"));
}

#[tokio::test]
async fn offer_computes_and_announces_the_hash_off_task() {
    let f = fixture(ALICE);
    let path = std::env::temp_dir().join(format!("peerwave-send-{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"abc").unwrap();

    let session = f.registry.get_or_create(&addr(BOB), None);
    f.manager
        .offer_file(&session, path.clone(), "notes.txt", 3)
        .unwrap();

    let channel = f.channel.clone();
    wait_until(move || channel.sent_actions().iter().any(|a| a == "session-info")).await;
    let sent = f.channel.sent();
    let info = sent
        .iter()
        .find(|s| {
            s.child_ns("session", ns::SIGNALING)
                .and_then(|e| e.attr("action"))
                == Some("session-info")
        })
        .unwrap();
    let (algo, hash) =
        signaling::parse_checksum(info.child_ns("session", ns::SIGNALING).unwrap()).unwrap();
    assert_eq!(algo, HashAlgo::Sha256);
    assert_eq!(
        hash,
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn listener_failure_fails_the_attempt() {
    let mut f = fixture(BOB);
    f.transport.fail_listener.store(true, Ordering::Relaxed);
    let offer = signaling::offer(
        &addr(ALICE),
        &addr(BOB),
        "sid-nolisten",
        &FileDescriptor::inbound("notes.txt", 100, HashAlgo::Sha256),
        TransportKind::Relay,
        &[relay_cand("alice-1", 80)],
        false,
        None,
    );
    assert!(f.manager.handle_signaling(&offer));

    assert!(drain(&mut f.events)
        .iter()
        .any(|e| matches!(e, TransferEvent::Failed { .. })));
    assert_eq!(f.manager.active_transfers(), 0);
    assert!(f
        .channel
        .sent_actions()
        .iter()
        .any(|a| a == "session-terminate"));
}

#[tokio::test]
async fn malformed_offer_gets_an_error_reply() {
    let f = fixture(BOB);
    // An envelope whose content has no description.
    let bad = Stanza::new("iq")
        .with_attr("type", "set")
        .with_attr("id", "bad-1")
        .with_attr("from", ALICE)
        .with_attr("to", BOB)
        .with_child(
            Stanza::new_ns("session", ns::SIGNALING)
                .with_attr("action", "session-initiate")
                .with_attr("sid", "sid-bad")
                .with_attr("initiator", ALICE)
                .with_child(Stanza::new("content")),
        );
    assert!(f.manager.handle_signaling(&bad));
    let sent = f.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].attr("type"), Some("error"));
    assert_eq!(sent[0].id(), Some("bad-1"));
    assert_eq!(f.manager.active_transfers(), 0);
}
