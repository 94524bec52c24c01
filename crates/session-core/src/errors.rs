//! Error types for session-core.

use thiserror::Error;

use peerwave_stanza_core::StanzaError;

/// Errors produced by the session registry and dispatcher.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An outbound request id was registered twice.
    #[error("request id already awaiting an answer: {0}")]
    DuplicateRequest(String),

    /// The underlying connection is gone; the operation was not performed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Outbound send failed at the transport.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Wire-model error while interpreting a stanza.
    #[error("stanza error: {0}")]
    Stanza(#[from] StanzaError),
}

/// Result type for session-core operations.
pub type Result<T> = std::result::Result<T, SessionError>;
