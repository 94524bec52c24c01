//! Peer-to-peer file-transfer negotiation.
//!
//! This crate negotiates a direct data channel between two peers over an
//! existing signaling channel: candidate exchange for the relay transport,
//! fallback to an in-band channel when no candidate is viable, hash-based
//! integrity verification, and mid-transfer transport replacement.
//!
//! # Architecture
//!
//! ```text
//!  inbound signaling ──▶ TransferManager ──▶ TransferNegotiator (per sid)
//!   (via dispatcher)          │                    │ actions
//!                             │◀───────────────────┘
//!                             ├──▶ ByteStreamTransport (listen/connect/stream)
//!                             ├──▶ signal channel ◀── background work
//!                             └──▶ TransferEvent channel ──▶ application
//! ```
//!
//! The negotiator is a pure state machine; every transition is fed by the
//! manager in arrival order and answered with a list of actions, so all
//! protocol interleavings are unit-testable without any I/O.

// Error handling
pub mod errors;

// Negotiation states
pub mod state;

// Transport candidates and the arbiter
pub mod candidate;

// File metadata
pub mod file;

// Integrity hashing and derived digests
pub mod hash;

// Application-visible events
pub mod events;

// Transport subsystem contract
pub mod transport;

// Signaling vocabulary (builders/parsers)
pub mod signaling;

// Per-attempt state machine
pub mod negotiator;

// Manager, signal channel, run loop
pub mod driver;

// Public exports
pub use candidate::{choose, ChosenCandidate, Nomination, TransportCandidate};
pub use driver::{TransferConfig, TransferManager, TransferSignal};
pub use errors::{Result, TransferError};
pub use events::TransferEvent;
pub use file::{FileDescriptor, HashAlgo, TransferRole};
pub use negotiator::{NegotiatorAction, TransferNegotiator};
pub use state::TransferState;
pub use transport::{ByteStreamTransport, ListenerHandle, TransportKind};
