//! Contracts to the byte-stream transport subsystem.
//!
//! The negotiator drives the relay and in-band transports through this
//! narrow interface but never touches their wire I/O. Every call must
//! return promptly; long-running work (listening, connecting, streaming)
//! happens inside the transport, which reports outcomes back onto the
//! signaling task through the transfer signal channel.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::candidate::TransportCandidate;
use crate::driver::TransferSignal;
use crate::errors::Result;
use crate::file::{FileDescriptor, TransferRole};

/// The two negotiable data-channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct relay through nominated streamhost candidates.
    Relay,
    /// Fallback channel carried inside the signaling stream itself.
    InBand,
}

/// Handle for an open local listener.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    pub port: u16,
    pub auth_token: String,
}

/// Byte-stream transport operations, treated as opaque async work.
///
/// Implementations must not block: `connect_to_hosts` and `send_file`
/// kick off background work and report through `signals`.
pub trait ByteStreamTransport: Send + Sync {
    /// Candidates this end can offer to the peer.
    fn local_candidates(&self, sid: &str) -> Vec<TransportCandidate>;

    /// Open a local listener for the transfer. Synchronous failure means
    /// no listener could be opened at all.
    fn start_listener(
        &self,
        sid: &str,
        port: u16,
        auth_token: &str,
        descriptor: &FileDescriptor,
        role: TransferRole,
    ) -> Result<ListenerHandle>;

    /// Try the given candidate hosts. Reports `CandidateConnected` for the
    /// first success or `CandidateFailed` when every attempt is exhausted.
    fn connect_to_hosts(
        &self,
        sid: &str,
        candidates: Vec<TransportCandidate>,
        signals: mpsc::UnboundedSender<TransferSignal>,
    );

    /// Start the byte flow. `over` carries the authoritative candidate for
    /// the relay transport; `None` means the in-band channel.
    fn send_file(
        &self,
        sid: &str,
        descriptor: &FileDescriptor,
        role: TransferRole,
        over: Option<TransportCandidate>,
        signals: mpsc::UnboundedSender<TransferSignal>,
    );

    /// Close any listener or connection still open for the transfer.
    /// Must be idempotent.
    fn stop(&self, sid: &str);
}
