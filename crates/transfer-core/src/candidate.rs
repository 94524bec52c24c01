//! Transport candidates and the arbiter that picks between them.
//!
//! A candidate is a concrete relay endpoint one party proposes for the
//! direct data channel. Each side reports exactly one outcome: the
//! candidate it managed to connect to, or "nothing worked". When both
//! outcomes are known the arbiter decides whose candidate is authoritative;
//! the decision is pure and commutative over arrival order.

use serde::{Deserialize, Serialize};

/// A concrete network endpoint proposed for the relay transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCandidate {
    /// Candidate id, unique within the transfer session.
    pub cid: String,
    /// Streamhost address.
    pub host: String,
    pub port: u16,
    /// Declared preference; higher wins.
    pub priority: u32,
    /// Address of the party that declared this candidate.
    pub owner: String,
}

impl TransportCandidate {
    pub fn new(cid: impl Into<String>, host: impl Into<String>, port: u16, priority: u32) -> Self {
        Self {
            cid: cid.into(),
            host: host.into(),
            port,
            priority,
            owner: String::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }
}

/// One party's candidate outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Nomination {
    /// Outcome not yet reported.
    #[default]
    Undecided,
    /// The party reported candidate-error: it nominated nothing.
    Nothing,
    /// The party nominated this candidate.
    Candidate(TransportCandidate),
}

impl Nomination {
    /// True when the party explicitly nominated nothing.
    pub fn is_nothing(&self) -> bool {
        matches!(self, Nomination::Nothing)
    }

    pub fn candidate(&self) -> Option<&TransportCandidate> {
        match self {
            Nomination::Candidate(c) => Some(c),
            _ => None,
        }
    }
}

/// Whose nominated candidate the transfer will use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChosenCandidate {
    Ours(TransportCandidate),
    Peers(TransportCandidate),
    /// Both sides nominated nothing; there is nothing to use.
    Neither,
}

impl ChosenCandidate {
    pub fn candidate(&self) -> Option<&TransportCandidate> {
        match self {
            ChosenCandidate::Ours(c) | ChosenCandidate::Peers(c) => Some(c),
            ChosenCandidate::Neither => None,
        }
    }
}

/// Decide whose candidate is authoritative.
///
/// A side that nominated nothing loses outright. Otherwise the higher
/// declared priority wins, and an exact tie goes to the session initiator
/// so both ends reach the same answer independently.
pub fn choose(ours: &Nomination, peers: &Nomination, we_initiated: bool) -> ChosenCandidate {
    match (ours.candidate(), peers.candidate()) {
        (Some(our), None) => ChosenCandidate::Ours(our.clone()),
        (None, Some(peer)) => ChosenCandidate::Peers(peer.clone()),
        (None, None) => ChosenCandidate::Neither,
        (Some(our), Some(peer)) => {
            if our.priority != peer.priority {
                if our.priority > peer.priority {
                    ChosenCandidate::Ours(our.clone())
                } else {
                    ChosenCandidate::Peers(peer.clone())
                }
            } else if we_initiated {
                ChosenCandidate::Ours(our.clone())
            } else {
                ChosenCandidate::Peers(peer.clone())
            }
        }
    }
}
