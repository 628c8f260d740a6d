use serde::{Deserialize, Serialize};
use tessera_core::{Block, Hash, QuorumCertificate};
use tracing::debug;

use crate::block_tree::BlockTree;
use crate::error::ConsensusError;

/// Per-replica voting state. Persisted before every vote leaves the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyState {
    pub locked_qc: QuorumCertificate,
    pub last_voted_view: u64,
    pub high_qc: QuorumCertificate,
}

impl SafetyState {
    pub fn genesis(genesis_hash: Hash) -> Self {
        SafetyState {
            locked_qc: QuorumCertificate::genesis(genesis_hash),
            last_voted_view: 0,
            high_qc: QuorumCertificate::genesis(genesis_hash),
        }
    }
}

/// Vote, lock and commit rules of chained HotStuff
#[derive(Debug, Clone)]
pub struct SafetyRules {
    state: SafetyState,
}

impl SafetyRules {
    pub fn new(state: SafetyState) -> Self {
        SafetyRules { state }
    }

    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    pub fn locked_qc(&self) -> &QuorumCertificate {
        &self.state.locked_qc
    }

    pub fn high_qc(&self) -> &QuorumCertificate {
        &self.state.high_qc
    }

    pub fn last_voted_view(&self) -> u64 {
        self.state.last_voted_view
    }

    /// Check the vote rule for `block` (hash `hash`) in `view`.
    /// Never mutates; a failure means the vote is withheld.
    pub fn check_vote(
        &self,
        block: &Block,
        hash: &Hash,
        view: u64,
        tree: &BlockTree,
    ) -> Result<(), ConsensusError> {
        if block.view != view {
            return Err(ConsensusError::safety(format!(
                "block view {} is not the voting view {}",
                block.view, view
            )));
        }
        if view <= self.state.last_voted_view {
            return Err(ConsensusError::safety(format!(
                "already voted in view {}",
                self.state.last_voted_view
            )));
        }

        let locked = &self.state.locked_qc;
        let extends_lock = block.parent_hash == locked.block_hash || tree.extends(hash, &locked.block_hash);
        if !extends_lock && block.justify_qc.view <= locked.view {
            return Err(ConsensusError::safety(format!(
                "block {} neither extends locked block {} nor carries a newer QC ({} <= {})",
                hash.short(),
                locked.block_hash.short(),
                block.justify_qc.view,
                locked.view
            )));
        }
        Ok(())
    }

    /// Raise the voting floor. Returns false if `view` is not above it.
    pub fn record_vote(&mut self, view: u64) -> bool {
        if view <= self.state.last_voted_view {
            return false;
        }
        self.state.last_voted_view = view;
        true
    }

    pub fn update_high_qc(&mut self, qc: &QuorumCertificate) -> bool {
        if qc.view <= self.state.high_qc.view {
            return false;
        }
        self.state.high_qc = qc.clone();
        true
    }

    /// Two-chain lock: on a QC for B3, lock on `B3.justify` if it is newer
    pub fn update_lock(&mut self, qc: &QuorumCertificate, tree: &BlockTree) -> bool {
        let candidate = match tree.block(&qc.block_hash) {
            Some(b3) => &b3.justify_qc,
            None => return false,
        };
        if candidate.view <= self.state.locked_qc.view {
            return false;
        }
        debug!(
            "Locked on {} at view {}",
            candidate.block_hash.short(),
            candidate.view
        );
        self.state.locked_qc = candidate.clone();
        true
    }
}

/// Three-chain commit rule. Given a QC for B3, returns B1's hash and the
/// QC that certifies it (B2's justify) when B1 <- B2 <- B3 are direct
/// parents with consecutive views.
pub fn commit_candidate(qc: &QuorumCertificate, tree: &BlockTree) -> Option<(Hash, QuorumCertificate)> {
    let b3 = tree.block(&qc.block_hash)?;
    let qc2 = &b3.justify_qc;
    let b2 = tree.block(&qc2.block_hash)?;
    let qc1 = &b2.justify_qc;
    let b1 = tree.block(&qc1.block_hash)?;

    let direct = b3.parent_hash == qc2.block_hash && b2.parent_hash == qc1.block_hash;
    let consecutive = b1.view + 1 == b2.view && b2.view + 1 == b3.view;
    if !(direct && consecutive) {
        return None;
    }
    if b1.height <= tree.root_height() {
        return None;
    }
    Some((qc1.block_hash, qc2.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{GenesisConfig, KeyPair, QuorumRule, ValidatorInfo, VotePhase};

    fn genesis() -> Block {
        GenesisConfig {
            chain_id: 1,
            timestamp: 0,
            validators: vec![ValidatorInfo::new(KeyPair::from_seed(0).public, 1)],
            quorum_rule: QuorumRule::Byzantine,
        }
        .create_genesis_block()
    }

    /// An unsigned stand-in QC; these rules never look at signatures
    fn qc_for(block: &Block) -> QuorumCertificate {
        QuorumCertificate {
            block_hash: block.hash().unwrap(),
            view: block.view,
            height: block.height,
            phase: VotePhase::Generic,
            epoch: 0,
            signatures: vec![],
        }
    }

    fn child(parent: &Block, view: u64, justify: QuorumCertificate) -> Block {
        Block {
            chain_id: 1,
            height: parent.height + 1,
            view,
            epoch: 0,
            proposer: KeyPair::from_seed(0).public,
            parent_hash: parent.hash().unwrap(),
            payload_hash: Hash::ZERO,
            timestamp: view,
            justify_qc: justify,
        }
    }

    fn chain(views: &[u64]) -> (BlockTree, Vec<Block>) {
        let g = genesis();
        let mut tree = BlockTree::new(g.clone()).unwrap();
        let mut blocks = vec![g.clone()];
        let mut justify = QuorumCertificate::genesis(g.hash().unwrap());
        for &view in views {
            let parent = blocks.last().unwrap().clone();
            let block = child(&parent, view, justify);
            tree.insert(block.clone(), vec![]).unwrap();
            justify = qc_for(&block);
            blocks.push(block);
        }
        (tree, blocks)
    }

    #[test]
    fn test_commit_rule_three_chain() {
        let (tree, blocks) = chain(&[1, 2, 3]);
        let (committed, commit_qc) = commit_candidate(&qc_for(&blocks[3]), &tree).unwrap();
        assert_eq!(committed, blocks[1].hash().unwrap());
        assert_eq!(commit_qc.block_hash, blocks[2].hash().unwrap());
    }

    #[test]
    fn test_commit_rule_needs_consecutive_views() {
        let (tree, blocks) = chain(&[1, 3, 4]);
        assert!(commit_candidate(&qc_for(&blocks[3]), &tree).is_none());

        // Genesis is already committed, so a two-block chain commits nothing
        let (tree, blocks) = chain(&[1, 2]);
        assert!(commit_candidate(&qc_for(&blocks[2]), &tree).is_none());
    }

    #[test]
    fn test_lock_moves_to_b3_justify() {
        let (tree, blocks) = chain(&[1, 2, 3]);
        let mut rules = SafetyRules::new(SafetyState::genesis(blocks[0].hash().unwrap()));

        assert!(rules.update_lock(&qc_for(&blocks[3]), &tree));
        assert_eq!(rules.locked_qc().block_hash, blocks[2].hash().unwrap());

        // Never moves backwards
        assert!(!rules.update_lock(&qc_for(&blocks[2]), &tree));
        assert_eq!(rules.locked_qc().view, 2);
    }

    #[test]
    fn test_vote_rule() {
        let (mut tree, blocks) = chain(&[1, 2, 3]);
        let mut rules = SafetyRules::new(SafetyState::genesis(blocks[0].hash().unwrap()));
        rules.update_lock(&qc_for(&blocks[3]), &tree);

        // Extends the lock
        let b4 = child(&blocks[3], 4, qc_for(&blocks[3]));
        let h4 = b4.hash().unwrap();
        tree.insert(b4.clone(), vec![]).unwrap();
        rules.check_vote(&b4, &h4, 4, &tree).unwrap();

        // Wrong view
        assert!(rules.check_vote(&b4, &h4, 5, &tree).is_err());

        // A fork off B1 justified by an old QC is refused
        let fork = child(&blocks[1], 5, qc_for(&blocks[1]));
        let hf = fork.hash().unwrap();
        tree.insert(fork.clone(), vec![]).unwrap();
        assert!(matches!(
            rules.check_vote(&fork, &hf, 5, &tree),
            Err(ConsensusError::SafetyViolation(_))
        ));

        // Once voted, the same view is refused
        assert!(rules.record_vote(4));
        assert!(!rules.record_vote(4));
        assert!(rules.check_vote(&b4, &h4, 4, &tree).is_err());
    }

    #[test]
    fn test_fork_with_newer_qc_is_votable() {
        let (mut tree, blocks) = chain(&[1, 2, 3]);
        let mut rules = SafetyRules::new(SafetyState::genesis(blocks[0].hash().unwrap()));
        rules.update_lock(&qc_for(&blocks[3]), &tree);

        // Fork off B1, but justified with a QC newer than the lock
        let mut newer = qc_for(&blocks[1]);
        newer.view = 7;
        let fork = child(&blocks[1], 8, newer);
        let hf = fork.hash().unwrap();
        tree.insert(fork.clone(), vec![]).unwrap();
        rules.check_vote(&fork, &hf, 8, &tree).unwrap();
    }

    #[test]
    fn test_high_qc_only_advances() {
        let (_, blocks) = chain(&[1, 2]);
        let mut rules = SafetyRules::new(SafetyState::genesis(blocks[0].hash().unwrap()));

        assert!(rules.update_high_qc(&qc_for(&blocks[2])));
        assert!(!rules.update_high_qc(&qc_for(&blocks[1])));
        assert!(!rules.update_high_qc(&qc_for(&blocks[2])));
        assert_eq!(rules.high_qc().view, 2);
    }
}
