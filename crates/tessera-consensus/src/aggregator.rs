use std::collections::{BTreeMap, HashMap, HashSet};

use tessera_core::{
    Hash, PublicKey, QuorumCertificate, TimeoutCertificate, TimeoutMsg, TimeoutSignature,
    ValidatorSet, ValidatorSignature, Vote, VotePhase,
};
use tracing::debug;

use crate::error::ConsensusError;
use crate::evidence::EquivocationEvidence;

type BucketKey = (u64, VotePhase, Hash);

#[derive(Debug)]
struct VoteBucket {
    height: u64,
    epoch: u64,
    /// Keyed by validator index so the QC comes out in canonical order
    signatures: BTreeMap<usize, ValidatorSignature>,
    weight: u64,
}

/// Collects votes into `(view, phase, block)` buckets and emits each QC once.
#[derive(Debug, Default)]
pub struct VoteAggregator {
    buckets: HashMap<BucketKey, VoteBucket>,
    completed: HashSet<BucketKey>,
    voted: HashMap<(u64, VotePhase, PublicKey), Vote>,
    phase_weight: HashMap<(u64, VotePhase), u64>,
    min_view: u64,
}

impl VoteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vote checked against `set`. Returns the QC when this vote
    /// completes its bucket; later votes for the same bucket return `None`.
    pub fn add_vote(
        &mut self,
        vote: &Vote,
        set: &ValidatorSet,
    ) -> Result<Option<QuorumCertificate>, ConsensusError> {
        let index = set.index_of(&vote.voter).ok_or_else(|| {
            ConsensusError::malformed(format!("vote from non-validator {}", vote.voter.short()))
        })?;
        if vote.epoch != set.epoch {
            return Err(ConsensusError::malformed(format!(
                "vote for epoch {} (active epoch {})",
                vote.epoch, set.epoch
            )));
        }
        if vote.view < self.min_view {
            return Err(ConsensusError::StaleMessage {
                view: vote.view,
                current: self.min_view,
            });
        }
        vote.verify_signature()
            .map_err(|_| ConsensusError::malformed(format!("bad vote signature from {}", vote.voter.short())))?;

        let voter_key = (vote.view, vote.phase, vote.voter);
        if let Some(previous) = self.voted.get(&voter_key) {
            if previous.block_hash == vote.block_hash {
                return Ok(None);
            }
            return Err(ConsensusError::Equivocation(Box::new(EquivocationEvidence::Vote {
                first: previous.clone(),
                second: vote.clone(),
            })));
        }
        self.voted.insert(voter_key, vote.clone());

        let weight = set.weight_of(&vote.voter).unwrap_or(0);
        *self.phase_weight.entry((vote.view, vote.phase)).or_default() += weight;

        let key = (vote.view, vote.phase, vote.block_hash);
        if self.completed.contains(&key) {
            return Ok(None);
        }

        let bucket = self.buckets.entry(key).or_insert_with(|| VoteBucket {
            height: vote.height,
            epoch: vote.epoch,
            signatures: BTreeMap::new(),
            weight: 0,
        });
        if bucket.height != vote.height {
            return Err(ConsensusError::malformed(format!(
                "vote height {} disagrees with bucket height {}",
                vote.height, bucket.height
            )));
        }
        bucket.signatures.insert(
            index,
            ValidatorSignature {
                validator_pubkey: vote.voter,
                signature: vote.signature,
            },
        );
        bucket.weight += weight;

        if bucket.weight < set.quorum_threshold() {
            return Ok(None);
        }

        let bucket = match self.buckets.remove(&key) {
            Some(bucket) => bucket,
            None => return Ok(None),
        };
        self.completed.insert(key);
        debug!(
            "Formed {} QC for {} at view {} ({} signers)",
            vote.phase,
            vote.block_hash.short(),
            vote.view,
            bucket.signatures.len()
        );

        Ok(Some(QuorumCertificate {
            block_hash: vote.block_hash,
            view: vote.view,
            height: bucket.height,
            phase: vote.phase,
            epoch: bucket.epoch,
            signatures: bucket.signatures.into_values().collect(),
        }))
    }

    /// Weight of all distinct voters seen for `(view, phase)`, any block
    pub fn phase_weight(&self, view: u64, phase: VotePhase) -> u64 {
        self.phase_weight.get(&(view, phase)).copied().unwrap_or(0)
    }

    /// True once no block (nil included) can still reach quorum in
    /// `(view, phase)` given the votes already cast.
    pub fn quorum_impossible(&self, view: u64, phase: VotePhase, set: &ValidatorSet) -> bool {
        if self
            .completed
            .iter()
            .any(|(v, p, _)| *v == view && *p == phase)
        {
            return false;
        }
        let best = self
            .buckets
            .iter()
            .filter(|((v, p, _), _)| *v == view && *p == phase)
            .map(|(_, bucket)| bucket.weight)
            .max()
            .unwrap_or(0);
        let outstanding = set
            .total_weight()
            .saturating_sub(self.phase_weight(view, phase));
        best + outstanding < set.quorum_threshold()
    }

    /// Drop everything below `min_view`; votes for those views become stale
    pub fn prune(&mut self, min_view: u64) {
        if min_view <= self.min_view {
            return;
        }
        self.min_view = min_view;
        self.buckets.retain(|(view, _, _), _| *view >= min_view);
        self.completed.retain(|(view, _, _)| *view >= min_view);
        self.voted.retain(|(view, _, _), _| *view >= min_view);
        self.phase_weight.retain(|(view, _), _| *view >= min_view);
    }

    pub fn min_view(&self) -> u64 {
        self.min_view
    }
}

#[derive(Debug)]
struct TimeoutBucket {
    signatures: BTreeMap<usize, TimeoutSignature>,
    weight: u64,
    high_qc: QuorumCertificate,
}

/// Collects timeout messages per view into timeout certificates
#[derive(Debug, Default)]
pub struct TimeoutAggregator {
    buckets: HashMap<u64, TimeoutBucket>,
    completed: HashSet<u64>,
    min_view: u64,
}

impl TimeoutAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a timeout message. The caller is expected to have verified the
    /// carried high QC; only the envelope-level checks happen here.
    pub fn add_timeout(
        &mut self,
        msg: &TimeoutMsg,
        set: &ValidatorSet,
    ) -> Result<Option<TimeoutCertificate>, ConsensusError> {
        let index = set.index_of(&msg.voter).ok_or_else(|| {
            ConsensusError::malformed(format!("timeout from non-validator {}", msg.voter.short()))
        })?;
        if msg.epoch != set.epoch {
            return Err(ConsensusError::malformed(format!(
                "timeout for epoch {} (active epoch {})",
                msg.epoch, set.epoch
            )));
        }
        if msg.view < self.min_view {
            return Err(ConsensusError::StaleMessage {
                view: msg.view,
                current: self.min_view,
            });
        }
        msg.verify_signature()
            .map_err(|_| ConsensusError::malformed(format!("bad timeout signature from {}", msg.voter.short())))?;

        if self.completed.contains(&msg.view) {
            return Ok(None);
        }

        let bucket = self.buckets.entry(msg.view).or_insert_with(|| TimeoutBucket {
            signatures: BTreeMap::new(),
            weight: 0,
            high_qc: msg.high_qc.clone(),
        });
        if bucket.signatures.contains_key(&index) {
            return Ok(None);
        }
        bucket.signatures.insert(
            index,
            TimeoutSignature {
                validator_pubkey: msg.voter,
                high_qc_view: msg.high_qc.view,
                signature: msg.signature,
            },
        );
        bucket.weight += set.weight_of(&msg.voter).unwrap_or(0);
        if msg.high_qc.view > bucket.high_qc.view {
            bucket.high_qc = msg.high_qc.clone();
        }

        if bucket.weight < set.quorum_threshold() {
            return Ok(None);
        }

        let bucket = match self.buckets.remove(&msg.view) {
            Some(bucket) => bucket,
            None => return Ok(None),
        };
        self.completed.insert(msg.view);
        debug!(
            "Formed TC for view {} ({} signers, high QC view {})",
            msg.view,
            bucket.signatures.len(),
            bucket.high_qc.view
        );

        Ok(Some(TimeoutCertificate {
            view: msg.view,
            epoch: msg.epoch,
            high_qc: bucket.high_qc,
            signatures: bucket.signatures.into_values().collect(),
        }))
    }

    pub fn prune(&mut self, min_view: u64) {
        if min_view <= self.min_view {
            return;
        }
        self.min_view = min_view;
        self.buckets.retain(|view, _| *view >= min_view);
        self.completed.retain(|view| *view >= min_view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::EpochManager;
    use crate::qc::{verify_qc, verify_tc};
    use tessera_core::{hash_blake3, KeyPair, QuorumRule, ValidatorInfo};

    fn keys(n: u64) -> Vec<KeyPair> {
        (0..n).map(KeyPair::from_seed).collect()
    }

    fn uniform(kps: &[KeyPair], rule: QuorumRule) -> ValidatorSet {
        ValidatorSet::uniform(0, kps.iter().map(|k| k.public).collect(), rule).unwrap()
    }

    fn vote(kp: &KeyPair, block: Hash, view: u64) -> Vote {
        Vote::new_signed(block, view, 1, VotePhase::Generic, 0, kp).unwrap()
    }

    #[test]
    fn test_qc_formed_exactly_once() {
        let kps = keys(4);
        let set = uniform(&kps, QuorumRule::Byzantine);
        let block = hash_blake3(b"b1");
        let mut agg = VoteAggregator::new();

        assert!(agg.add_vote(&vote(&kps[3], block, 1), &set).unwrap().is_none());
        assert!(agg.add_vote(&vote(&kps[0], block, 1), &set).unwrap().is_none());
        let qc = agg.add_vote(&vote(&kps[2], block, 1), &set).unwrap().unwrap();
        assert_eq!(qc.signature_count(), 3);
        assert!(agg.add_vote(&vote(&kps[1], block, 1), &set).unwrap().is_none());

        // Signatures come out in validator order and verify
        let signers: Vec<_> = qc.signers().copied().collect();
        assert_eq!(signers, vec![kps[0].public, kps[2].public, kps[3].public]);
        let epochs = EpochManager::new(set);
        verify_qc(&qc, &epochs, &Hash::ZERO).unwrap();
    }

    #[test]
    fn test_duplicate_vote_ignored() {
        let kps = keys(4);
        let set = uniform(&kps, QuorumRule::Byzantine);
        let block = hash_blake3(b"b1");
        let mut agg = VoteAggregator::new();

        let v = vote(&kps[0], block, 1);
        assert!(agg.add_vote(&v, &set).unwrap().is_none());
        assert!(agg.add_vote(&v, &set).unwrap().is_none());
        assert!(agg.add_vote(&vote(&kps[1], block, 1), &set).unwrap().is_none());
        assert_eq!(agg.phase_weight(1, VotePhase::Generic), 2);
    }

    #[test]
    fn test_equivocation_detected() {
        let kps = keys(4);
        let set = uniform(&kps, QuorumRule::Byzantine);
        let mut agg = VoteAggregator::new();

        agg.add_vote(&vote(&kps[0], hash_blake3(b"a"), 1), &set).unwrap();
        let err = agg
            .add_vote(&vote(&kps[0], hash_blake3(b"b"), 1), &set)
            .unwrap_err();
        match err {
            ConsensusError::Equivocation(evidence) => assert_eq!(evidence.offender(), &kps[0].public),
            other => panic!("expected equivocation, got {other}"),
        }
    }

    #[test]
    fn test_rejects_outsider_and_bad_signature() {
        let kps = keys(5);
        let set = uniform(&kps[..4], QuorumRule::Byzantine);
        let mut agg = VoteAggregator::new();

        let outsider = vote(&kps[4], hash_blake3(b"a"), 1);
        assert!(matches!(agg.add_vote(&outsider, &set), Err(ConsensusError::MalformedMessage(_))));

        let mut forged = vote(&kps[0], hash_blake3(b"a"), 1);
        forged.block_hash = hash_blake3(b"other");
        assert!(matches!(agg.add_vote(&forged, &set), Err(ConsensusError::MalformedMessage(_))));
    }

    #[test]
    fn test_stale_votes_rejected_after_prune() {
        let kps = keys(4);
        let set = uniform(&kps, QuorumRule::Byzantine);
        let mut agg = VoteAggregator::new();

        agg.add_vote(&vote(&kps[0], hash_blake3(b"a"), 2), &set).unwrap();
        agg.prune(3);
        let err = agg.add_vote(&vote(&kps[1], hash_blake3(b"a"), 2), &set).unwrap_err();
        assert!(err.is_stale());
        assert_eq!(agg.phase_weight(2, VotePhase::Generic), 0);
    }

    #[test]
    fn test_simple_majority_threshold() {
        let kps = keys(4);
        let set = uniform(&kps, QuorumRule::SimpleMajority);
        let block = hash_blake3(b"b");
        let mut agg = VoteAggregator::new();

        assert!(agg.add_vote(&vote(&kps[0], block, 1), &set).unwrap().is_none());
        assert!(agg.add_vote(&vote(&kps[1], block, 1), &set).unwrap().is_none());
        assert!(agg.add_vote(&vote(&kps[2], block, 1), &set).unwrap().is_some());
    }

    #[test]
    fn test_weighted_threshold() {
        let kps = keys(4);
        let set = ValidatorSet::new(
            0,
            vec![
                ValidatorInfo::new(kps[0].public, 5),
                ValidatorInfo::new(kps[1].public, 1),
                ValidatorInfo::new(kps[2].public, 1),
                ValidatorInfo::new(kps[3].public, 1),
            ],
            QuorumRule::Byzantine,
        )
        .unwrap();
        // total 8, threshold 6
        let block = hash_blake3(b"b");
        let mut agg = VoteAggregator::new();

        for kp in &kps[1..] {
            assert!(agg.add_vote(&vote(kp, block, 1), &set).unwrap().is_none());
        }
        let qc = agg.add_vote(&vote(&kps[0], block, 1), &set).unwrap();
        assert!(qc.is_some());
    }

    #[test]
    fn test_quorum_impossible_after_split() {
        let kps = keys(4);
        let set = uniform(&kps, QuorumRule::Byzantine);
        let mut agg = VoteAggregator::new();

        agg.add_vote(&vote(&kps[0], hash_blake3(b"a"), 1), &set).unwrap();
        agg.add_vote(&vote(&kps[1], hash_blake3(b"b"), 1), &set).unwrap();
        assert!(!agg.quorum_impossible(1, VotePhase::Generic, &set));

        agg.add_vote(&vote(&kps[2], Hash::ZERO, 1), &set).unwrap();
        assert!(agg.quorum_impossible(1, VotePhase::Generic, &set));
    }

    #[test]
    fn test_timeout_certificate_carries_highest_qc() {
        let kps = keys(4);
        let set = uniform(&kps, QuorumRule::Byzantine);
        let genesis_hash = hash_blake3(b"genesis");
        let mut votes = VoteAggregator::new();
        let block = hash_blake3(b"b1");
        let mut high_qc = None;
        for kp in &kps[..3] {
            high_qc = votes.add_vote(&vote(kp, block, 1), &set).unwrap().or(high_qc);
        }
        let high_qc = high_qc.unwrap();

        let mut agg = TimeoutAggregator::new();
        let genesis_qc = QuorumCertificate::genesis(genesis_hash);
        let t0 = TimeoutMsg::new_signed(2, 0, genesis_qc.clone(), &kps[0]).unwrap();
        let t1 = TimeoutMsg::new_signed(2, 0, high_qc.clone(), &kps[1]).unwrap();
        let t2 = TimeoutMsg::new_signed(2, 0, genesis_qc, &kps[2]).unwrap();

        assert!(agg.add_timeout(&t0, &set).unwrap().is_none());
        assert!(agg.add_timeout(&t0, &set).unwrap().is_none());
        assert!(agg.add_timeout(&t1, &set).unwrap().is_none());
        let tc = agg.add_timeout(&t2, &set).unwrap().unwrap();
        assert_eq!(tc.view, 2);
        assert_eq!(tc.high_qc, high_qc);

        let epochs = EpochManager::new(set.clone());
        verify_tc(&tc, &epochs, &genesis_hash).unwrap();

        let t3 = TimeoutMsg::new_signed(2, 0, high_qc, &kps[3]).unwrap();
        assert!(agg.add_timeout(&t3, &set).unwrap().is_none());
    }
}
