//! Transfer negotiation states.

use serde::{Deserialize, Serialize};

/// State of one file-transfer negotiation attempt.
///
/// The happy path is `NotStarted → Initialized → {CandSent | CandReceived}
/// → CandSentAndReceived → Transferring`. When neither side's nominated
/// candidate is viable the initiator branches to `TransportReplace` and
/// re-enters `Transferring` once the fallback transport is accepted.
/// `Transferring` is terminal for the negotiator; the actual byte flow is
/// delegated to the transport subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Created, offer not yet acknowledged.
    NotStarted,
    /// Offer exchanged; local listener opening.
    Initialized,
    /// We announced our candidate outcome and await the peer's.
    CandSent,
    /// The peer announced its outcome and awaits ours.
    CandReceived,
    /// Both outcomes are known (nominations or explicit errors).
    CandSentAndReceived,
    /// The initiator is proposing a fallback transport.
    TransportReplace,
    /// Negotiation finished; bytes are moving.
    Transferring,
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferState::NotStarted => "not-started",
            TransferState::Initialized => "initialized",
            TransferState::CandSent => "cand-sent",
            TransferState::CandReceived => "cand-received",
            TransferState::CandSentAndReceived => "cand-sent-and-received",
            TransferState::TransportReplace => "transport-replace",
            TransferState::Transferring => "transferring",
        };
        write!(f, "{name}")
    }
}
