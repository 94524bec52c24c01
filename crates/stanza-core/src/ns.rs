//! Namespace vocabulary for the signaling elements this engine consumes
//! and produces. Only namespaces the session and transfer layers actually
//! touch are listed; the surrounding application owns the rest.

/// Session negotiation envelope (offers, accepts, transport-info).
pub const SIGNALING: &str = "urn:peerwave:signaling:1";

/// File-transfer content description.
pub const FILE_TRANSFER: &str = "urn:peerwave:apps:file-transfer:1";

/// Direct-relay (streamhost) transport.
pub const RELAY_TRANSPORT: &str = "urn:peerwave:transports:relay:1";

/// In-band fallback transport carried inside the signaling stream.
pub const INBAND_TRANSPORT: &str = "urn:peerwave:transports:inband:1";

/// Integrity hash elements attached to file offers.
pub const HASHES: &str = "urn:peerwave:hashes:1";

/// Delivery receipt requests and acknowledgements.
pub const RECEIPTS: &str = "urn:peerwave:receipts";

/// Stable stanza ids required for trustworthy room archives.
pub const STABLE_ID: &str = "urn:peerwave:sid:0";

/// Security/fingerprint preconditions on a transfer.
pub const SECURITY: &str = "urn:peerwave:security:1";
