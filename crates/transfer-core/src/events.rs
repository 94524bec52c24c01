//! Events published by the transfer layer.
//!
//! Consumers (the shell, notification surfaces) only ever see these; the
//! negotiator never calls outward directly. Failures surface here too —
//! never as dialogs or panics from the signaling task.

use serde::{Deserialize, Serialize};

use crate::file::FileDescriptor;

/// Events emitted over the transfer event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferEvent {
    /// A remote peer offered us a file; the application should accept or
    /// reject the attempt.
    Requested {
        sid: String,
        peer: String,
        file: FileDescriptor,
    },
    /// The initiator proposed falling back to the in-band transport.
    TransportReplaced { sid: String },
    /// Negotiation finished; bytes are moving.
    Started { sid: String },
    /// The byte flow completed. `verified` is the integrity-check outcome
    /// when a declared hash was available.
    Completed { sid: String, verified: Option<bool> },
    /// The attempt failed irrecoverably.
    Failed { sid: String, reason: String },
    /// The attempt was cancelled, locally or by the peer.
    Cancelled { sid: String },
}

impl TransferEvent {
    /// Transfer session this event belongs to.
    pub fn sid(&self) -> &str {
        match self {
            TransferEvent::Requested { sid, .. }
            | TransferEvent::TransportReplaced { sid }
            | TransferEvent::Started { sid }
            | TransferEvent::Completed { sid, .. }
            | TransferEvent::Failed { sid, .. }
            | TransferEvent::Cancelled { sid } => sid,
        }
    }
}
