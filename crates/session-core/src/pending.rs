//! Pending request / timeout registry.
//!
//! Every outbound request that expects a correlated reply registers here
//! keyed by its request id, tagged with a wait-reason and a deadline.
//! Expiry is checked opportunistically whenever any reply arrives: a
//! deadline sweep fires each timed-out entry's user-visible notice exactly
//! once and removes it, so a late genuine reply for that id is ignored.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use peerwave_stanza_core::PeerAddr;

use crate::errors::{Result, SessionError};

/// Why a request id is being waited on. Drives the side effect run when
/// the reply (or timeout) arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitReason {
    /// An agent/gateway unregistration was requested.
    AgentRemoved { agent: PeerAddr },
    /// Metacontact definitions were requested from private storage.
    MetacontactsRequested,
    /// The contact roster was requested.
    RosterRequested,
    /// The nested-group delimiter was requested from private storage.
    DelimiterRequested,
    /// The privacy list index was requested.
    PrivacyListRequested,
    /// A publish-subscribe node configuration was requested.
    PepConfigRequested,
}

/// One awaiting-answer entry.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub reason: WaitReason,
    pub deadline: Instant,
    /// User-visible message fired if the deadline elapses unanswered.
    pub timeout_notice: String,
}

/// Registry of outstanding request ids.
///
/// Mutated only from the signaling task; the lock exists so the dispatcher
/// can stay `&self` like the rest of the engine.
#[derive(Default)]
pub struct PendingRegistry {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request. Each id may appear at most once.
    pub fn register(
        &self,
        id: impl Into<String>,
        reason: WaitReason,
        deadline: Instant,
        timeout_notice: impl Into<String>,
    ) -> Result<()> {
        let id = id.into();
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(SessionError::DuplicateRequest(id));
        }
        entries.insert(
            id,
            PendingRequest {
                reason,
                deadline,
                timeout_notice: timeout_notice.into(),
            },
        );
        Ok(())
    }

    /// Remove and return the entry for a reply id, if still outstanding.
    pub fn take(&self, id: &str) -> Option<PendingRequest> {
        self.entries.lock().remove(id)
    }

    /// Remove every entry whose deadline has passed, returning
    /// (id, timeout notice) pairs. Each expired entry is returned exactly
    /// once; afterwards its id matches nothing.
    pub fn sweep(&self, now: Instant) -> Vec<(String, String)> {
        let mut fired = Vec::new();
        self.entries.lock().retain(|id, req| {
            if req.deadline <= now {
                debug!(%id, "pending request timed out");
                fired.push((id.clone(), req.timeout_notice.clone()));
                false
            } else {
                true
            }
        });
        fired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn duplicate_ids_are_rejected() {
        let reg = PendingRegistry::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        reg.register("r1", WaitReason::RosterRequested, deadline, "roster lost")
            .unwrap();
        let err = reg
            .register("r1", WaitReason::RosterRequested, deadline, "roster lost")
            .unwrap_err();
        assert!(matches!(err, SessionError::DuplicateRequest(_)));
    }

    #[test]
    fn timeout_fires_once_and_late_reply_is_ignored() {
        let reg = PendingRegistry::new();
        let start = Instant::now();
        reg.register(
            "r1",
            WaitReason::DelimiterRequested,
            start + Duration::from_secs(30),
            "storage unreachable",
        )
        .unwrap();

        // Not yet due.
        assert!(reg.sweep(start + Duration::from_secs(29)).is_empty());

        let fired = reg.sweep(start + Duration::from_secs(30));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "r1");
        assert_eq!(fired[0].1, "storage unreachable");

        // Exactly once: a second sweep and a late reply both see nothing.
        assert!(reg.sweep(start + Duration::from_secs(60)).is_empty());
        assert!(reg.take("r1").is_none());
    }

    #[test]
    fn reply_removes_entry_before_expiry() {
        let reg = PendingRegistry::new();
        let start = Instant::now();
        reg.register(
            "r2",
            WaitReason::MetacontactsRequested,
            start + Duration::from_secs(30),
            "no answer",
        )
        .unwrap();

        let req = reg.take("r2").unwrap();
        assert_eq!(req.reason, WaitReason::MetacontactsRequested);
        assert!(reg.sweep(start + Duration::from_secs(60)).is_empty());
    }
}
