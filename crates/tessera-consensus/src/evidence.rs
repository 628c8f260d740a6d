use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tessera_core::{Hash, PublicKey, Vote};
use tracing::{debug, warn};

use crate::error::ConsensusError;

/// Proof that a validator signed two conflicting statements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquivocationEvidence {
    /// Two votes for different blocks in the same view and phase
    Vote { first: Vote, second: Vote },
    /// Two different proposals from the leader of one view
    Proposal {
        proposer: PublicKey,
        view: u64,
        first: Hash,
        second: Hash,
    },
}

impl EquivocationEvidence {
    pub fn offender(&self) -> &PublicKey {
        match self {
            EquivocationEvidence::Vote { first, .. } => &first.voter,
            EquivocationEvidence::Proposal { proposer, .. } => proposer,
        }
    }

    pub fn view(&self) -> u64 {
        match self {
            EquivocationEvidence::Vote { first, .. } => first.view,
            EquivocationEvidence::Proposal { view, .. } => *view,
        }
    }

    fn key(&self) -> (PublicKey, u64, u8) {
        let kind = match self {
            EquivocationEvidence::Vote { first, .. } => first.phase as u8,
            EquivocationEvidence::Proposal { .. } => u8::MAX,
        };
        (*self.offender(), self.view(), kind)
    }
}

/// Evidence collected by this replica, one entry per offence
#[derive(Debug, Default)]
pub struct EvidenceLog {
    entries: Vec<EquivocationEvidence>,
    seen: HashSet<(PublicKey, u64, u8)>,
}

impl EvidenceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if this offence was already recorded
    pub fn record(&mut self, evidence: EquivocationEvidence) -> bool {
        if !self.seen.insert(evidence.key()) {
            return false;
        }
        warn!(
            "Recorded equivocation by {} in view {}",
            evidence.offender().short(),
            evidence.view()
        );
        self.entries.push(evidence);
        true
    }

    pub fn entries(&self) -> &[EquivocationEvidence] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stale messages are logged once per this many
const STALE_LOG_EVERY: u64 = 100;

/// Counts runtime faults per source and keeps stale-message noise down
#[derive(Debug, Default)]
pub struct FaultTracker {
    by_source: HashMap<PublicKey, u64>,
    total: u64,
    stale: u64,
    evidence: EvidenceLog,
}

impl FaultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and count a fault. Equivocation evidence is moved into the log.
    pub fn record(&mut self, source: Option<&PublicKey>, error: ConsensusError) {
        self.total += 1;
        if let Some(source) = source {
            *self.by_source.entry(*source).or_default() += 1;
        }
        let from = source.map(|s| s.short()).unwrap_or_else(|| "local".to_string());

        match error {
            ConsensusError::StaleMessage { view, current } => {
                self.stale += 1;
                if self.stale % STALE_LOG_EVERY == 1 {
                    debug!(
                        "Dropping stale message from {} for view {} (current {}, {} stale so far)",
                        from, view, current, self.stale
                    );
                }
            }
            ConsensusError::Equivocation(evidence) => {
                self.evidence.record(*evidence);
            }
            other => warn!("Fault from {}: {}", from, other),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn stale(&self) -> u64 {
        self.stale
    }

    pub fn count_for(&self, source: &PublicKey) -> u64 {
        self.by_source.get(source).copied().unwrap_or(0)
    }

    pub fn evidence(&self) -> &EvidenceLog {
        &self.evidence
    }

    pub fn evidence_mut(&mut self) -> &mut EvidenceLog {
        &mut self.evidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{hash_blake3, KeyPair, VotePhase};

    fn vote(kp: &KeyPair, block: &[u8]) -> Vote {
        Vote::new_signed(hash_blake3(block), 4, 2, VotePhase::Generic, 0, kp).unwrap()
    }

    #[test]
    fn test_evidence_recorded_once_per_offence() {
        let kp = KeyPair::from_seed(1);
        let mut log = EvidenceLog::new();
        let evidence = EquivocationEvidence::Vote {
            first: vote(&kp, b"a"),
            second: vote(&kp, b"b"),
        };

        assert!(log.record(evidence.clone()));
        assert!(!log.record(evidence));
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].offender(), &kp.public);
    }

    #[test]
    fn test_fault_tracker_counts_per_source() {
        let kp = KeyPair::from_seed(1);
        let mut tracker = FaultTracker::new();

        tracker.record(Some(&kp.public), ConsensusError::malformed("bad"));
        tracker.record(Some(&kp.public), ConsensusError::StaleMessage { view: 1, current: 5 });
        tracker.record(None, ConsensusError::ExecutionFailure("boom".into()));

        assert_eq!(tracker.total(), 3);
        assert_eq!(tracker.stale(), 1);
        assert_eq!(tracker.count_for(&kp.public), 2);
    }

    #[test]
    fn test_equivocation_fault_lands_in_evidence_log() {
        let kp = KeyPair::from_seed(2);
        let mut tracker = FaultTracker::new();
        let evidence = EquivocationEvidence::Vote {
            first: vote(&kp, b"a"),
            second: vote(&kp, b"b"),
        };

        tracker.record(Some(&kp.public), ConsensusError::Equivocation(Box::new(evidence)));
        assert_eq!(tracker.evidence().len(), 1);
    }
}
