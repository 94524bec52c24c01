//! Peer addresses for a federated messaging network.
//!
//! An address has the shape `local@domain` (bare) or `local@domain/resource`
//! (full). Ordinary chat state is keyed by the bare address; private-room
//! occupants are only distinguishable by the full address, so the resource
//! part is significant there.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StanzaError};

/// A peer address, bare or resource-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    /// Local part (account name).
    local: String,

    /// Domain of the peer's home server.
    domain: String,

    /// Optional resource/device qualifier.
    resource: Option<String>,
}

impl PeerAddr {
    /// Build an address from its parts.
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
            resource: None,
        }
    }

    /// Attach a resource qualifier, producing a full address.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Local part of the address.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Domain part of the address.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Resource qualifier, if this is a full address.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// True when no resource qualifier is present.
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The bare form of this address (resource dropped).
    pub fn bare(&self) -> PeerAddr {
        PeerAddr {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)?;
        if let Some(res) = &self.resource {
            write!(f, "/{}", res)?;
        }
        Ok(())
    }
}

impl FromStr for PeerAddr {
    type Err = StanzaError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, resource) = match s.split_once('/') {
            Some((addr, res)) if !res.is_empty() => (addr, Some(res)),
            Some(_) => return Err(StanzaError::InvalidAddress(s.to_string())),
            None => (s, None),
        };

        let (local, domain) = addr
            .split_once('@')
            .ok_or_else(|| StanzaError::InvalidAddress(s.to_string()))?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(StanzaError::InvalidAddress(s.to_string()));
        }

        let mut parsed = PeerAddr::new(local, domain);
        if let Some(res) = resource {
            parsed = parsed.with_resource(res);
        }
        Ok(parsed)
    }
}
