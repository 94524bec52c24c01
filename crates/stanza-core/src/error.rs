//! Error types for the wire data model.

use thiserror::Error;

/// Errors produced while interpreting addresses and stanzas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StanzaError {
    /// A peer address did not have the `local@domain[/resource]` shape.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// An expected attribute was absent.
    #[error("missing attribute '{0}'")]
    MissingAttr(String),

    /// The stanza is not of the kind the caller required.
    #[error("unexpected stanza <{0}>")]
    UnexpectedStanza(String),
}

/// Result type for stanza-core operations.
pub type Result<T> = std::result::Result<T, StanzaError>;
