//! Error types for transfer-core.

use thiserror::Error;

/// Errors produced during file-transfer negotiation.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No attempt is known under this transfer session id.
    #[error("unknown transfer session: {0}")]
    UnknownSession(String),

    /// The local listener for the chosen transport could not be opened.
    #[error("listener failed: {0}")]
    ListenerFailed(String),

    /// The declared hash algorithm is not one we can compute.
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),

    /// Reading the local file for hashing failed.
    #[error("file i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound signaling could not be sent.
    #[error("signaling send failed: {0}")]
    Signaling(String),
}

/// Result type for transfer-core operations.
pub type Result<T> = std::result::Result<T, TransferError>;
