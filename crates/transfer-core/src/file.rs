//! File metadata carried through a transfer negotiation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TransferError};

/// Integrity hash algorithms this engine computes. Peers may declare
/// others; those are carried opaquely and verified by whoever can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgo {
    Sha256,
    Sha1,
}

impl HashAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgo::Sha256 => "sha-256",
            HashAlgo::Sha1 => "sha-1",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sha-256" => Ok(HashAlgo::Sha256),
            "sha-1" => Ok(HashAlgo::Sha1),
            other => Err(TransferError::UnsupportedHashAlgorithm(other.to_string())),
        }
    }
}

/// Which end of the byte flow we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRole {
    Sender,
    Receiver,
}

/// Declared metadata of the file under negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// File name as announced to the peer.
    pub name: String,
    /// Local path; set on the sending side only.
    pub path: Option<PathBuf>,
    /// Declared size in bytes.
    pub size: u64,
    /// Declared hash algorithm.
    pub hash_algo: HashAlgo,
    /// Integrity hash, hex encoded, once known.
    pub hash: Option<String>,
}

impl FileDescriptor {
    /// Descriptor for a local file we are offering.
    pub fn outbound(name: impl Into<String>, path: PathBuf, size: u64) -> Self {
        Self {
            name: name.into(),
            path: Some(path),
            size,
            hash_algo: HashAlgo::Sha256,
            hash: None,
        }
    }

    /// Descriptor built from a remote offer.
    pub fn inbound(name: impl Into<String>, size: u64, hash_algo: HashAlgo) -> Self {
        Self {
            name: name.into(),
            path: None,
            size,
            hash_algo,
            hash: None,
        }
    }
}
