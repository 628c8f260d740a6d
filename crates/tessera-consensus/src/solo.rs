//! Single-validator engine for development chains.
//!
//! No peers and no rounds: fetch a batch, execute it, certify it with the
//! local key and commit. One block is in flight at a time, and the next
//! batch is fetched only after storage has acknowledged the previous one,
//! so the pool has already dropped its transactions.

use tessera_core::{Block, Hash, KeyPair, Proposal, PublicKey, QuorumCertificate, TimeoutMsg, Transaction};
use tessera_core::{CommittedBlock, ValidatorSet, Vote, VotePhase};
use tracing::{debug, error, info, warn};

use crate::aggregator::VoteAggregator;
use crate::engine::{now_millis, Action, CoreEngine, EngineConfig, EngineStatus, TimeoutKind};
use crate::epoch::EpochManager;
use crate::error::ConsensusError;
use crate::events::BlockCommittedEvent;
use crate::evidence::FaultTracker;
use crate::execution::ExecutionOutcome;
use crate::registry::ConsensusKind;

#[derive(Debug)]
struct InFlight {
    hash: Hash,
    block: Block,
    txs: Vec<Transaction>,
}

pub struct SoloEngine {
    keypair: KeyPair,
    chain_id: u64,
    epochs: EpochManager,
    max_batch_txs: usize,
    max_batch_bytes: usize,
    votes: VoteAggregator,
    faults: FaultTracker,
    running: bool,
    head: Block,
    head_hash: Hash,
    head_qc: QuorumCertificate,
    batch_pending: Option<u64>,
    in_flight: Option<InFlight>,
    /// Committed block whose storage acknowledgement is outstanding
    awaiting_store: Option<Hash>,
}

impl SoloEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ConsensusError> {
        let set = config.validate()?;
        if set.len() != 1 {
            return Err(ConsensusError::ConfigurationFault(format!(
                "SOLO runs exactly one validator, genesis lists {}",
                set.len()
            )));
        }

        let genesis = config.genesis.create_genesis_block();
        let genesis_hash = genesis.hash()?;
        let (head, head_hash, head_qc) = match config.committed_head {
            Some(committed) if committed.height() > 0 => {
                let hash = committed.hash()?;
                (committed.block, hash, committed.commit_qc)
            }
            _ => (genesis, genesis_hash, QuorumCertificate::genesis(genesis_hash)),
        };

        Ok(SoloEngine {
            chain_id: config.genesis.chain_id,
            epochs: EpochManager::new(set),
            max_batch_txs: config.max_batch_txs,
            max_batch_bytes: config.max_batch_bytes,
            votes: VoteAggregator::new(),
            faults: FaultTracker::new(),
            running: false,
            head,
            head_hash,
            head_qc,
            batch_pending: None,
            in_flight: None,
            awaiting_store: None,
            keypair: config.keypair,
        })
    }

    fn next_height(&self) -> u64 {
        self.head.height + 1
    }

    fn busy(&self) -> bool {
        self.batch_pending.is_some() || self.in_flight.is_some() || self.awaiting_store.is_some()
    }

    fn try_propose(&mut self) -> Vec<Action> {
        if !self.running || self.busy() {
            return Vec::new();
        }
        let view = self.next_height();
        self.batch_pending = Some(view);
        vec![Action::FetchBatch {
            view,
            max_count: self.max_batch_txs,
            max_bytes: self.max_batch_bytes,
        }]
    }

    fn propose(&mut self, view: u64, txs: Vec<Transaction>) -> Result<Vec<Action>, ConsensusError> {
        let block = Block {
            chain_id: self.chain_id,
            height: view,
            view,
            epoch: self.epochs.epoch(),
            proposer: self.keypair.public,
            parent_hash: self.head_hash,
            payload_hash: Block::compute_payload_hash(&txs)?,
            timestamp: now_millis().max(self.head.timestamp),
            justify_qc: self.head_qc.clone(),
        };
        let hash = block.hash()?;
        debug!("Executing block {} at height {} ({} txs)", hash.short(), view, txs.len());

        self.in_flight = Some(InFlight {
            hash,
            block: block.clone(),
            txs: txs.clone(),
        });
        Ok(vec![Action::Execute { block, txs }])
    }

    fn certify(&mut self, pending: InFlight, outcome: ExecutionOutcome) -> Result<Vec<Action>, ConsensusError> {
        let block = &pending.block;
        let vote = Vote::new_signed(
            pending.hash,
            block.view,
            block.height,
            VotePhase::Generic,
            block.epoch,
            &self.keypair,
        )?;
        let set = self
            .epochs
            .get(block.epoch)
            .ok_or_else(|| ConsensusError::safety(format!("no validator set for epoch {}", block.epoch)))?;
        let qc = self
            .votes
            .add_vote(&vote, set)?
            .ok_or_else(|| ConsensusError::safety("local vote did not form a quorum"))?;
        self.votes.prune(block.view + 1);

        let committed = CommittedBlock {
            block: pending.block,
            txs: pending.txs,
            commit_qc: qc.clone(),
            state_root: outcome.state_root,
        };
        info!(
            "Committed block {} at height {} ({} txs)",
            pending.hash.short(),
            committed.block.height,
            committed.txs.len()
        );

        self.head = committed.block.clone();
        self.head_hash = pending.hash;
        self.head_qc = qc;
        self.awaiting_store = Some(pending.hash);
        if self.epochs.maybe_activate(self.head.height) {
            info!("Validator set epoch {} active from height {}", self.epochs.epoch(), self.next_height());
        }

        let event = BlockCommittedEvent::from_committed(&committed, pending.hash);
        Ok(vec![Action::Commit(committed), Action::Publish(event)])
    }

    fn reject_peer_input(&mut self, source: Option<&PublicKey>, what: &str) -> Vec<Action> {
        self.faults
            .record(source, ConsensusError::malformed(format!("{} sent to a SOLO node", what)));
        Vec::new()
    }
}

impl CoreEngine for SoloEngine {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Solo
    }

    fn start(&mut self) -> Vec<Action> {
        if self.running {
            return Vec::new();
        }
        self.running = true;
        info!(
            "Starting SOLO at height {} as {}",
            self.next_height(),
            self.keypair.public.short()
        );
        self.try_propose()
    }

    fn stop(&mut self) -> Vec<Action> {
        if self.running {
            info!("Stopping SOLO at height {}", self.next_height());
        }
        self.running = false;
        Vec::new()
    }

    fn on_receive_proposal(&mut self, sender: &PublicKey, _view: u64, _proposal: Proposal) -> Vec<Action> {
        self.reject_peer_input(Some(sender), "proposal")
    }

    fn on_receive_vote(&mut self, vote: Vote) -> Vec<Action> {
        self.reject_peer_input(Some(&vote.voter), "vote")
    }

    fn on_receive_timeout(&mut self, msg: TimeoutMsg) -> Vec<Action> {
        self.reject_peer_input(Some(&msg.voter), "timeout")
    }

    fn on_receive_qc(&mut self, _qc: QuorumCertificate) -> Vec<Action> {
        self.reject_peer_input(None, "certificate")
    }

    fn on_local_timeout(&mut self, _view: u64, _kind: TimeoutKind) -> Vec<Action> {
        Vec::new()
    }

    fn on_tx_pool_ready(&mut self) -> Vec<Action> {
        self.try_propose()
    }

    fn on_batch_ready(&mut self, view: u64, txs: Vec<Transaction>) -> Vec<Action> {
        if self.batch_pending != Some(view) {
            return Vec::new();
        }
        self.batch_pending = None;
        if !self.running || txs.is_empty() {
            return Vec::new();
        }
        match self.propose(view, txs) {
            Ok(actions) => actions,
            Err(e) => {
                self.faults.record(None, e);
                Vec::new()
            }
        }
    }

    fn on_execution_completed(&mut self, block_hash: Hash, outcome: Result<ExecutionOutcome, String>) -> Vec<Action> {
        let pending = match self.in_flight.take() {
            Some(pending) if pending.hash == block_hash => pending,
            other => {
                self.in_flight = other;
                return Vec::new();
            }
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Dropping block at height {}: execution failed", pending.block.height);
                self.faults.record(
                    None,
                    ConsensusError::ExecutionFailure(format!("block {}: {}", block_hash.short(), e)),
                );
                return Vec::new();
            }
        };
        match self.certify(pending, outcome) {
            Ok(actions) => actions,
            Err(e) => {
                self.faults.record(None, e);
                Vec::new()
            }
        }
    }

    fn on_commit_completed(&mut self, height: u64, block_hash: Hash, result: Result<(), String>) -> Vec<Action> {
        match result {
            Ok(()) => debug!("Stored block {} at height {}", block_hash.short(), height),
            Err(e) => error!("Failed to store block {} at height {}: {}", block_hash.short(), height, e),
        }
        if self.awaiting_store != Some(block_hash) {
            return Vec::new();
        }
        self.awaiting_store = None;
        self.try_propose()
    }

    fn on_block_request(&mut self, from: &PublicKey, _block_hash: Hash) -> Vec<Action> {
        self.reject_peer_input(Some(from), "block request")
    }

    fn on_block_response(&mut self, from: &PublicKey, _proposal: Option<Proposal>) -> Vec<Action> {
        self.reject_peer_input(Some(from), "block response")
    }

    fn on_validator_set_update(&mut self, set: ValidatorSet, activation_height: u64) -> Vec<Action> {
        if set.len() != 1 || !set.contains(&self.keypair.public) {
            warn!(
                "Ignoring validator set for epoch {}: SOLO keeps its single local validator",
                set.epoch
            );
            return Vec::new();
        }
        self.epochs.schedule(set, activation_height);
        Vec::new()
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            kind: ConsensusKind::Solo,
            running: self.running,
            view: self.next_height(),
            round: 0,
            epoch: self.epochs.epoch(),
            committed_height: self.head.height,
            committed_hash: self.head_hash,
            locked_view: self.head_qc.view,
            high_qc_view: self.head_qc.view,
            last_voted_view: self.head_qc.view,
            leader: self.keypair.public,
            is_leader: true,
            consecutive_timeouts: 0,
            faults: self.faults.total(),
            equivocations: self.faults.evidence().len(),
        }
    }

    fn record_fault(&mut self, source: Option<&PublicKey>, error: ConsensusError) {
        self.faults.record(source, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{GenesisConfig, QuorumRule, ValidatorInfo};

    use crate::qc::verify_qc;

    fn config(kps: &[KeyPair]) -> EngineConfig {
        let genesis = GenesisConfig {
            chain_id: 11,
            timestamp: 0,
            validators: kps.iter().map(|k| ValidatorInfo::new(k.public, 1)).collect(),
            quorum_rule: QuorumRule::Byzantine,
        };
        EngineConfig::new(kps[0].clone(), genesis)
    }

    fn tx(seed: u64) -> Transaction {
        let kp = KeyPair::from_seed(300 + seed);
        Transaction::new_signed(kp.public, seed, 1, vec![seed as u8], &kp.secret).unwrap()
    }

    fn outcome() -> ExecutionOutcome {
        ExecutionOutcome {
            state_root: Hash::ZERO,
            results: vec![],
        }
    }

    fn execute(actions: &[Action]) -> (Block, Vec<Transaction>) {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Execute { block, txs } => Some((block.clone(), txs.clone())),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_rejects_multi_validator_genesis() {
        let kps: Vec<KeyPair> = (0..2).map(KeyPair::from_seed).collect();
        assert!(SoloEngine::new(config(&kps)).err().unwrap().is_fatal());
    }

    #[test]
    fn test_commits_each_batch_in_order() {
        let kps = vec![KeyPair::from_seed(0)];
        let mut engine = SoloEngine::new(config(&kps)).unwrap();
        let genesis_hash = engine.head_hash;

        let actions = engine.start();
        assert!(matches!(actions.as_slice(), [Action::FetchBatch { view: 1, .. }]));
        // Nothing to do with an empty pool; retried on the next pool signal
        assert!(engine.on_batch_ready(1, vec![]).is_empty());
        assert!(matches!(engine.on_tx_pool_ready().as_slice(), [Action::FetchBatch { view: 1, .. }]));

        let (block, txs) = execute(&engine.on_batch_ready(1, vec![tx(1)]));
        assert_eq!(block.height, 1);
        assert_eq!(block.parent_hash, genesis_hash);
        assert_eq!(txs.len(), 1);
        // Busy until the block is executed and stored
        assert!(engine.on_tx_pool_ready().is_empty());

        let hash = block.hash().unwrap();
        let actions = engine.on_execution_completed(hash, Ok(outcome()));
        let committed = actions
            .iter()
            .find_map(|a| match a {
                Action::Commit(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::Publish(e) if e.height == 1)));
        assert_eq!(committed.commit_qc.block_hash, hash);
        let epochs = EpochManager::new(engine.epochs.current().clone());
        verify_qc(&committed.commit_qc, &epochs, &genesis_hash).unwrap();
        assert_eq!(engine.status().committed_height, 1);
        assert!(engine.on_tx_pool_ready().is_empty());

        let next = engine.on_commit_completed(1, hash, Ok(()));
        assert!(matches!(next.as_slice(), [Action::FetchBatch { view: 2, .. }]));
        let (block2, _) = execute(&engine.on_batch_ready(2, vec![tx(2)]));
        assert_eq!(block2.parent_hash, hash);
        assert_eq!(block2.justify_qc, committed.commit_qc);
    }

    #[test]
    fn test_failed_execution_drops_block() {
        let kps = vec![KeyPair::from_seed(0)];
        let mut engine = SoloEngine::new(config(&kps)).unwrap();
        engine.start();
        let (block, _) = execute(&engine.on_batch_ready(1, vec![tx(1)]));

        let actions = engine.on_execution_completed(block.hash().unwrap(), Err("bad tx".into()));
        assert!(actions.is_empty());
        assert_eq!(engine.status().committed_height, 0);
        assert_eq!(engine.status().faults, 1);
        assert!(matches!(engine.on_tx_pool_ready().as_slice(), [Action::FetchBatch { view: 1, .. }]));
    }

    #[test]
    fn test_peer_messages_are_faults() {
        let kps = vec![KeyPair::from_seed(0)];
        let mut engine = SoloEngine::new(config(&kps)).unwrap();
        engine.start();
        let stranger = KeyPair::from_seed(5);
        let vote = Vote::new_signed(Hash::ZERO, 1, 1, VotePhase::Generic, 0, &stranger).unwrap();
        assert!(engine.on_receive_vote(vote).is_empty());
        assert_eq!(engine.status().faults, 1);
        assert!(engine.status().is_leader);
    }
}
