//! Wire data model for the peerwave messaging engine.
//!
//! This crate holds the protocol-unit types shared by the session and
//! transfer layers: peer addresses (bare and resource-qualified), the
//! generic XML-like [`Stanza`] element tree delivered by the decoded
//! transport, and the namespace vocabulary used by the signaling code.
//! It performs no I/O and owns no wire parser; stanzas arrive already
//! decoded from the protocol transport.

// Error handling
pub mod error;

// Peer addressing
pub mod addr;

// Generic protocol units
pub mod stanza;

// Namespace vocabulary
pub mod ns;

// Public exports
pub use addr::PeerAddr;
pub use error::{Result, StanzaError};
pub use stanza::{IqKind, MessageKind, Stanza, StanzaKind};

/// Re-export of common types
pub mod prelude {
    pub use super::{IqKind, MessageKind, PeerAddr, Result, Stanza, StanzaError, StanzaKind};
}
