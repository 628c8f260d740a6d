//! Tendermint-style BFT.
//!
//! One height at a time, each decided over one or more rounds of
//! propose, prevote and precommit. Votes are broadcast to everyone and
//! every replica aggregates them itself. A block is final as soon as a
//! precommit quorum forms for it, and its precommit QC becomes the
//! `justify_qc` of the next height's block.

pub mod round;

use std::collections::{BTreeMap, HashMap};

use tessera_core::{
    Block, ConsensusMessage, Hash, KeyPair, MessagePayload, Proposal, PublicKey, QuorumCertificate,
    TimeoutMsg, Transaction, ValidatorSet, Vote, VotePhase,
};
use tracing::{debug, error, info, warn};

use crate::aggregator::VoteAggregator;
use crate::block_tree::BlockTree;
use crate::commit::CommitPipeline;
use crate::engine::{now_millis, Action, CoreEngine, EngineConfig, EngineStatus, TimeoutConfig, TimeoutKind};
use crate::epoch::EpochManager;
use crate::error::ConsensusError;
use crate::evidence::{EquivocationEvidence, FaultTracker};
use crate::execution::ExecutionOutcome;
use crate::leader::LeaderRotation;
use crate::qc::verify_qc;
use crate::registry::ConsensusKind;
use crate::safety::SafetyState;

pub use round::{decode_view, encode_view, RoundState, Step, MAX_ROUND};

const MAX_PARKED: usize = 64;

#[derive(Debug)]
struct Parked {
    from: PublicKey,
    view: u64,
    hash: Hash,
    proposal: Proposal,
}

pub struct TbftEngine {
    keypair: KeyPair,
    chain_id: u64,
    genesis_hash: Hash,
    epochs: EpochManager,
    rotation: LeaderRotation,
    timeouts: TimeoutConfig,
    max_batch_txs: usize,
    max_batch_bytes: usize,
    tree: BlockTree,
    votes: VoteAggregator,
    commits: CommitPipeline,
    faults: FaultTracker,
    /// `locked_qc` is the prevote QC of the locked block; `high_qc` the
    /// latest precommit QC; `last_voted_view` the last round prevoted in
    safety: SafetyState,
    running: bool,
    state: RoundState,
    /// First proposal seen per view at the current height
    round_proposals: BTreeMap<u64, Hash>,
    /// Highest prevote QC per block at the current height
    polkas: HashMap<Hash, QuorumCertificate>,
    /// Block with the most recent polka, re-proposed by later proposers
    valid: Option<(Hash, QuorumCertificate)>,
    /// Precommit QCs for blocks not yet committed here
    commit_qcs: HashMap<Hash, QuorumCertificate>,
    /// Weight of validators seen voting in each future round
    future_rounds: BTreeMap<u64, HashMap<PublicKey, u64>>,
    parked: HashMap<Hash, Vec<Parked>>,
    parked_count: usize,
    batch_pending: Option<u64>,
}

impl TbftEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ConsensusError> {
        let set = config.validate()?;
        let genesis = config.genesis.create_genesis_block();
        let genesis_hash = genesis.hash()?;

        let tree = match &config.committed_head {
            Some(head) if head.height() > 0 => {
                BlockTree::with_root(head.block.clone(), head.commit_qc.clone())?
            }
            _ => BlockTree::new(genesis)?,
        };
        let safety = config
            .safety_state
            .clone()
            .unwrap_or_else(|| SafetyState::genesis(genesis_hash));

        // Never prevote twice in a round across restarts
        let height = tree.root_height() + 1;
        let (voted_height, voted_round) = decode_view(safety.last_voted_view);
        let round = if voted_height == height { voted_round + 1 } else { 0 };
        if round > MAX_ROUND {
            return Err(ConsensusError::ConfigurationFault(format!(
                "height {} already voted in its last encodable round",
                height
            )));
        }
        if config.safety_state.is_some() {
            info!("Recovered safety state, resuming at height {} round {}", height, round);
        }

        Ok(TbftEngine {
            chain_id: config.genesis.chain_id,
            genesis_hash,
            epochs: EpochManager::new(set),
            rotation: config.leader_rotation,
            timeouts: config.timeouts,
            max_batch_txs: config.max_batch_txs,
            max_batch_bytes: config.max_batch_bytes,
            commits: CommitPipeline::new(tree.root(), tree.root_height()),
            tree,
            votes: VoteAggregator::new(),
            faults: FaultTracker::new(),
            safety,
            running: false,
            state: RoundState::new(height, round),
            round_proposals: BTreeMap::new(),
            polkas: HashMap::new(),
            valid: None,
            commit_qcs: HashMap::new(),
            future_rounds: BTreeMap::new(),
            parked: HashMap::new(),
            parked_count: 0,
            batch_pending: None,
            keypair: config.keypair,
        })
    }

    pub fn round_state(&self) -> &RoundState {
        &self.state
    }

    pub fn safety_state(&self) -> &SafetyState {
        &self.safety
    }

    fn proposer(&self, height: u64, round: u64) -> PublicKey {
        self.rotation.leader_at(height + round, self.epochs.current())
    }

    fn is_proposer(&self) -> bool {
        self.proposer(self.state.height, self.state.round) == self.keypair.public
    }

    fn signed(&self, view: u64, payload: MessagePayload) -> Result<ConsensusMessage, ConsensusError> {
        Ok(ConsensusMessage::new_signed(view, payload, &self.keypair)?)
    }

    fn absorb(&mut self, source: Option<&PublicKey>, result: Result<Vec<Action>, ConsensusError>) -> Vec<Action> {
        match result {
            Ok(actions) => actions,
            Err(e) => {
                self.faults.record(source, e);
                Vec::new()
            }
        }
    }

    fn step_timer(&self, kind: TimeoutKind) -> Action {
        Action::ScheduleTimeout {
            view: self.state.view(),
            kind,
            duration: self.timeouts.step_timeout(kind, self.state.round),
        }
    }

    /// Whether the current lock binds votes at this height
    fn locked_here(&self) -> Option<&QuorumCertificate> {
        let locked = &self.safety.locked_qc;
        (locked.phase == VotePhase::Prevote && locked.height == self.state.height && !locked.is_nil())
            .then_some(locked)
    }

    fn enter_height(&mut self) -> Result<Vec<Action>, ConsensusError> {
        let height = self.tree.root_height() + 1;
        if self.epochs.maybe_activate(self.tree.root_height()) {
            info!("Validator set epoch {} active from height {}", self.epochs.epoch(), height);
        }
        self.state = RoundState::new(height, 0);
        self.votes.prune(encode_view(height, 0));
        self.round_proposals.clear();
        self.polkas.clear();
        self.valid = None;
        self.future_rounds.clear();
        let root_height = self.tree.root_height();
        self.commit_qcs.retain(|_, qc| qc.height > root_height);
        self.enter_round(0)
    }

    fn enter_round(&mut self, round: u64) -> Result<Vec<Action>, ConsensusError> {
        let height = self.state.height;
        // Views must keep increasing, so the round saturates instead of wrapping
        if round > MAX_ROUND {
            error!(
                "Round limit {} reached at height {}, holding at {}",
                MAX_ROUND, height, self.state
            );
            return Ok(Vec::new());
        }
        self.state = RoundState::new(height, round);
        self.state.step = Step::Propose;
        self.future_rounds = self.future_rounds.split_off(&(round + 1));
        debug!(
            "Entered round {} (proposer {})",
            self.state,
            self.proposer(height, round).short()
        );

        let mut actions = vec![self.step_timer(TimeoutKind::Propose)];
        if self.is_proposer() {
            actions.extend(self.start_proposal()?);
        }
        // A proposal for this round may have arrived early
        actions.extend(self.maybe_prevote()?);
        Ok(actions)
    }

    fn start_proposal(&mut self) -> Result<Vec<Action>, ConsensusError> {
        let view = self.state.view();
        if self.round_proposals.contains_key(&view) {
            return Ok(Vec::new());
        }

        if let Some((hash, polka)) = self.valid.clone() {
            if let Some(node) = self.tree.get(&hash) {
                let proposal = node.to_proposal();
                info!("Re-proposing block {} with polka from view {} at {}", hash.short(), polka.view, self.state);
                self.round_proposals.insert(view, hash);
                return Ok(vec![
                    Action::Broadcast(self.signed(view, MessagePayload::QcGossip(polka))?),
                    Action::Broadcast(self.signed(view, MessagePayload::Proposal(proposal))?),
                ]);
            }
        }

        if self.batch_pending == Some(view) {
            return Ok(Vec::new());
        }
        self.batch_pending = Some(view);
        Ok(vec![Action::FetchBatch {
            view,
            max_count: self.max_batch_txs,
            max_bytes: self.max_batch_bytes,
        }])
    }

    fn propose(&mut self, txs: Vec<Transaction>) -> Result<Vec<Action>, ConsensusError> {
        let committed = self.tree.tx_hashes_on_path(&self.tree.root());
        let txs: Vec<Transaction> = txs
            .into_iter()
            .filter(|tx| tx.hash().map(|h| !committed.contains(&h)).unwrap_or(false))
            .collect();
        if txs.is_empty() {
            debug!("Pool empty at {}, waiting", self.state);
            return Ok(Vec::new());
        }
        let root = self.tree.root();
        let parent = self
            .tree
            .block(&root)
            .cloned()
            .ok_or_else(|| ConsensusError::safety("committed root missing from tree"))?;
        let justify_qc = self
            .tree
            .qc_for(&root)
            .cloned()
            .unwrap_or_else(|| QuorumCertificate::genesis(self.genesis_hash));

        let view = self.state.view();
        let block = Block {
            chain_id: self.chain_id,
            height: self.state.height,
            view,
            epoch: self.epochs.epoch(),
            proposer: self.keypair.public,
            parent_hash: root,
            payload_hash: Block::compute_payload_hash(&txs)?,
            timestamp: now_millis().max(parent.timestamp),
            justify_qc,
        };
        let hash = block.hash()?;
        let proposal = Proposal::new(block, txs);
        info!("Proposing block {} at {} ({} txs)", hash.short(), self.state, proposal.txs.len());

        self.round_proposals.insert(view, hash);
        let mut actions = vec![Action::Broadcast(
            self.signed(view, MessagePayload::Proposal(proposal.clone()))?,
        )];
        let me = self.keypair.public;
        actions.extend(self.accept_proposal(&me, view, proposal, hash)?);
        Ok(actions)
    }

    /// Checks shared by live proposals and fetched blocks. `view` is the
    /// round the block is being proposed in, which for a re-proposal is
    /// later than the block's own view.
    fn validate_proposal(&self, sender: Option<&PublicKey>, view: u64, proposal: &Proposal) -> Result<Hash, ConsensusError> {
        let block = &proposal.block;
        let hash = block.hash()?;
        let (height, round) = decode_view(view);

        if block.chain_id != self.chain_id {
            return Err(ConsensusError::malformed(format!("wrong chain id {}", block.chain_id)));
        }
        let set = self
            .epochs
            .get(block.epoch)
            .ok_or_else(|| ConsensusError::malformed(format!("unknown epoch {}", block.epoch)))?;
        if block.height != height {
            return Err(ConsensusError::malformed(format!(
                "block height {} proposed at height {}",
                block.height, height
            )));
        }
        if let Some(sender) = sender {
            if self.rotation.leader_at(height + round, set) != *sender {
                return Err(ConsensusError::malformed(format!(
                    "{} is not the proposer of {}/{}",
                    sender.short(),
                    height,
                    round
                )));
            }
        }
        let (block_height, block_round) = decode_view(block.view);
        if block_height != height || block.view > view {
            return Err(ConsensusError::malformed("block view outside its proposal round"));
        }
        if self.rotation.leader_at(block_height + block_round, set) != block.proposer {
            return Err(ConsensusError::malformed(format!(
                "{} did not lead round {}/{}",
                block.proposer.short(),
                block_height,
                block_round
            )));
        }
        if !proposal.verify_payload()? {
            return Err(ConsensusError::malformed("payload hash mismatch"));
        }

        let justify = &block.justify_qc;
        if justify.block_hash != block.parent_hash || justify.height + 1 != block.height {
            return Err(ConsensusError::malformed("justify QC does not certify the parent"));
        }
        if !justify.is_genesis() && justify.phase != VotePhase::Precommit {
            return Err(ConsensusError::malformed("justify QC is not a precommit certificate"));
        }
        verify_qc(justify, &self.epochs, &self.genesis_hash)?;
        Ok(hash)
    }

    fn handle_proposal(&mut self, sender: &PublicKey, view: u64, proposal: Proposal) -> Result<Vec<Action>, ConsensusError> {
        let (height, _) = decode_view(view);
        if height < self.state.height {
            return Err(ConsensusError::StaleMessage {
                view,
                current: self.state.view(),
            });
        }
        let hash = self.validate_proposal(Some(sender), view, &proposal)?;

        if height == self.state.height {
            match self.round_proposals.get(&view) {
                Some(seen) if *seen == hash => return Ok(Vec::new()),
                Some(seen) => {
                    return Err(ConsensusError::Equivocation(Box::new(EquivocationEvidence::Proposal {
                        proposer: *sender,
                        view,
                        first: *seen,
                        second: hash,
                    })));
                }
                None => {
                    self.round_proposals.insert(view, hash);
                }
            }
        }
        self.accept_proposal(sender, view, proposal, hash)
    }

    /// Insert a validated block, fetching ancestors if it is ahead of us
    fn accept_proposal(&mut self, from: &PublicKey, view: u64, proposal: Proposal, hash: Hash) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = Vec::new();
        let parent = proposal.block.parent_hash;
        let justify = proposal.block.justify_qc.clone();

        if !self.tree.contains(&hash) {
            if parent == self.tree.root() {
                let Proposal { block, txs, .. } = proposal;
                if self.tree.insert(block.clone(), txs.clone())? {
                    actions.push(Action::Execute { block, txs });
                }
            } else if proposal.block.height <= self.tree.root_height() + 1 {
                return Err(ConsensusError::safety(format!(
                    "block {} at height {} does not extend committed block {}",
                    hash.short(),
                    proposal.block.height,
                    self.tree.root().short()
                )));
            } else {
                // Ahead of us: the justify QC proves the parent was decided
                self.commit_qcs.entry(parent).or_insert(justify);
                if self.park(*from, view, hash, proposal) {
                    debug!("Requesting missing block {} from {}", parent.short(), from.short());
                    actions.push(Action::Send {
                        to: *from,
                        message: self.signed(self.state.view(), MessagePayload::BlockRequest { block_hash: parent })?,
                    });
                }
                return Ok(actions);
            }
        }

        if view == self.state.view() {
            actions.extend(self.maybe_prevote()?);
        }
        actions.extend(self.try_commit(hash)?);
        Ok(actions)
    }

    fn park(&mut self, from: PublicKey, view: u64, hash: Hash, proposal: Proposal) -> bool {
        if self.parked_count >= MAX_PARKED {
            warn!("Too many blocks waiting for ancestors, dropping {}", hash.short());
            return false;
        }
        let waiting = self.parked.entry(proposal.block.parent_hash).or_default();
        if waiting.iter().any(|p| p.hash == hash) {
            return false;
        }
        waiting.push(Parked {
            from,
            view,
            hash,
            proposal,
        });
        self.parked_count += 1;
        true
    }

    fn replay_parked(&mut self, parent: &Hash) -> Vec<Action> {
        let children = match self.parked.remove(parent) {
            Some(children) => children,
            None => return Vec::new(),
        };
        self.parked_count = self.parked_count.saturating_sub(children.len());

        let mut actions = Vec::new();
        for child in children {
            let (height, _) = decode_view(child.view);
            if height == self.state.height {
                self.round_proposals.entry(child.view).or_insert(child.hash);
            }
            let result = self.accept_proposal(&child.from, child.view, child.proposal, child.hash);
            actions.extend(self.absorb(Some(&child.from), result));
        }
        actions
    }

    /// Prevote the current round's proposal once it has executed
    fn maybe_prevote(&mut self) -> Result<Vec<Action>, ConsensusError> {
        if self.state.step != Step::Propose || self.state.prevoted {
            return Ok(Vec::new());
        }
        let hash = match self.round_proposals.get(&self.state.view()) {
            Some(hash) => *hash,
            None => return Ok(Vec::new()),
        };
        let node = match self.tree.get(&hash) {
            Some(node) if node.is_executed() => node,
            _ => return Ok(Vec::new()),
        };

        let target = if node.outcome.is_none() {
            Hash::ZERO
        } else {
            match self.locked_here() {
                None => hash,
                Some(locked) if locked.block_hash == hash => hash,
                // A newer polka for another block releases the lock
                Some(locked) if self.polkas.get(&hash).is_some_and(|p| p.view > locked.view) => hash,
                Some(locked) => {
                    debug!(
                        "Locked on {} at {}, prevoting nil",
                        locked.block_hash.short(),
                        self.state
                    );
                    Hash::ZERO
                }
            }
        };
        self.cast_prevote(target)
    }

    fn cast_prevote(&mut self, target: Hash) -> Result<Vec<Action>, ConsensusError> {
        if self.state.prevoted {
            return Ok(Vec::new());
        }
        let view = self.state.view();
        let vote = Vote::new_signed(
            target,
            view,
            self.state.height,
            VotePhase::Prevote,
            self.epochs.epoch(),
            &self.keypair,
        )?;
        self.state.prevoted = true;
        self.state.step = Step::Prevote;
        self.safety.last_voted_view = self.safety.last_voted_view.max(view);
        debug!("Prevoting {} at {}", target.short(), self.state);

        let mut actions = vec![
            Action::PersistSafety(self.safety.clone()),
            Action::Broadcast(self.signed(view, MessagePayload::Vote(vote.clone()))?),
        ];
        actions.extend(self.count_vote(vote)?);
        actions.extend(self.advance_from_prevote()?);
        actions.extend(self.step_timers());
        Ok(actions)
    }

    fn cast_precommit(&mut self, target: Hash) -> Result<Vec<Action>, ConsensusError> {
        if self.state.precommitted {
            return Ok(Vec::new());
        }
        let view = self.state.view();
        let vote = Vote::new_signed(
            target,
            view,
            self.state.height,
            VotePhase::Precommit,
            self.epochs.epoch(),
            &self.keypair,
        )?;
        self.state.precommitted = true;
        self.state.step = Step::Precommit;
        debug!("Precommitting {} at {}", target.short(), self.state);

        let mut actions = Vec::new();
        if !target.is_zero() {
            if let Some(polka) = self.state.polka.clone() {
                self.safety.locked_qc = polka;
                actions.push(Action::PersistSafety(self.safety.clone()));
            }
        }
        actions.push(Action::Broadcast(self.signed(view, MessagePayload::Vote(vote.clone()))?));
        actions.extend(self.count_vote(vote)?);
        actions.extend(self.step_timers());
        Ok(actions)
    }

    /// Act on this round's polka once we have prevoted
    fn advance_from_prevote(&mut self) -> Result<Vec<Action>, ConsensusError> {
        if self.state.step != Step::Prevote || self.state.precommitted {
            return Ok(Vec::new());
        }
        let polka = match &self.state.polka {
            Some(polka) => polka.clone(),
            None => return Ok(Vec::new()),
        };
        if polka.is_nil() {
            return self.cast_precommit(Hash::ZERO);
        }
        match self.tree.get(&polka.block_hash) {
            Some(node) if node.outcome.is_some() => self.cast_precommit(polka.block_hash),
            Some(node) if node.execution_failed => self.cast_precommit(Hash::ZERO),
            // Still executing, or never received; the prevote timer decides
            _ => Ok(Vec::new()),
        }
    }

    /// Start the prevote/precommit timers once a quorum of any votes is in
    fn step_timers(&mut self) -> Vec<Action> {
        let view = self.state.view();
        let threshold = self.epochs.current().quorum_threshold();
        let mut actions = Vec::new();
        if self.state.step == Step::Prevote
            && !self.state.prevote_timer
            && self.votes.phase_weight(view, VotePhase::Prevote) >= threshold
        {
            self.state.prevote_timer = true;
            actions.push(self.step_timer(TimeoutKind::Prevote));
        }
        if self.state.step == Step::Precommit
            && !self.state.precommit_timer
            && self.votes.phase_weight(view, VotePhase::Precommit) >= threshold
        {
            self.state.precommit_timer = true;
            actions.push(self.step_timer(TimeoutKind::Precommit));
        }
        actions
    }

    fn handle_vote(&mut self, vote: Vote) -> Result<Vec<Action>, ConsensusError> {
        if vote.phase == VotePhase::Generic {
            return Err(ConsensusError::malformed("generic vote sent to TBFT"));
        }
        let (height, round) = decode_view(vote.view);
        if vote.height != height {
            return Err(ConsensusError::malformed(format!(
                "vote height {} does not match view height {}",
                vote.height, height
            )));
        }
        if height < self.state.height {
            return Err(ConsensusError::StaleMessage {
                view: vote.view,
                current: self.state.view(),
            });
        }

        let voter = vote.voter;
        let mut actions = self.count_vote(vote)?;
        actions.extend(self.step_timers());
        if height == self.state.height && round > self.state.round {
            actions.extend(self.note_future_round(voter, round)?);
        }
        Ok(actions)
    }

    fn count_vote(&mut self, vote: Vote) -> Result<Vec<Action>, ConsensusError> {
        let set = self
            .epochs
            .get(vote.epoch)
            .ok_or_else(|| ConsensusError::malformed(format!("vote for unknown epoch {}", vote.epoch)))?;
        match self.votes.add_vote(&vote, set)? {
            Some(qc) => self.on_qc(qc),
            None => Ok(Vec::new()),
        }
    }

    /// Jump ahead once validators holding more than a third of the weight
    /// are voting in a later round
    fn note_future_round(&mut self, voter: PublicKey, round: u64) -> Result<Vec<Action>, ConsensusError> {
        let set = self.epochs.current();
        let weight = match set.weight_of(&voter) {
            Some(weight) => weight,
            None => return Ok(Vec::new()),
        };
        let skip_threshold = set.total_weight() - set.quorum_threshold() + 1;
        let seen = self.future_rounds.entry(round).or_default();
        seen.insert(voter, weight);
        if seen.values().sum::<u64>() >= skip_threshold {
            info!("Skipping from {} to round {}", self.state, round);
            return self.enter_round(round);
        }
        Ok(Vec::new())
    }

    /// Apply a verified QC, formed here or gossiped
    fn on_qc(&mut self, qc: QuorumCertificate) -> Result<Vec<Action>, ConsensusError> {
        let (height, round) = decode_view(qc.view);
        match qc.phase {
            VotePhase::Generic => Err(ConsensusError::malformed("generic QC sent to TBFT")),
            VotePhase::Prevote => {
                if height != self.state.height {
                    return Ok(Vec::new());
                }
                let mut actions = Vec::new();
                actions.extend(self.on_polka(&qc, round));
                if round == self.state.round {
                    self.state.polka = Some(qc);
                    actions.extend(self.advance_from_prevote()?);
                }
                Ok(actions)
            }
            VotePhase::Precommit if qc.is_nil() => {
                if height == self.state.height && round >= self.state.round {
                    info!("Precommit quorum for nil at {}/{}", height, round);
                    return self.enter_round(round + 1);
                }
                Ok(Vec::new())
            }
            VotePhase::Precommit => {
                if height <= self.tree.root_height() {
                    return Ok(Vec::new());
                }
                let mut actions = Vec::new();
                if qc.view > self.safety.high_qc.view {
                    self.safety.high_qc = qc.clone();
                }
                let hash = qc.block_hash;
                self.commit_qcs.entry(hash).or_insert_with(|| qc.clone());
                if !self.tree.contains(&hash) {
                    let proposer = self.proposer(height, round);
                    if proposer != self.keypair.public {
                        debug!("Decided block {} unknown, requesting from {}", hash.short(), proposer.short());
                        actions.push(Action::Send {
                            to: proposer,
                            message: self.signed(self.state.view(), MessagePayload::BlockRequest { block_hash: hash })?,
                        });
                    }
                    return Ok(actions);
                }
                actions.extend(self.try_commit(hash)?);
                Ok(actions)
            }
        }
    }

    /// Track polkas for re-proposal and lock release
    fn on_polka(&mut self, qc: &QuorumCertificate, round: u64) -> Vec<Action> {
        if !qc.is_nil() {
            let newer = self.polkas.get(&qc.block_hash).map_or(true, |p| qc.view > p.view);
            if newer {
                self.polkas.insert(qc.block_hash, qc.clone());
            }
            let newer_valid = self.valid.as_ref().map_or(true, |(_, p)| qc.view > p.view);
            if newer_valid && self.tree.contains(&qc.block_hash) {
                self.valid = Some((qc.block_hash, qc.clone()));
            }
        }

        let relock = match self.locked_here() {
            Some(locked) => qc.view > locked.view && qc.block_hash != locked.block_hash,
            None => false,
        };
        if !relock {
            return Vec::new();
        }
        if qc.is_nil() {
            info!("Polka for nil in round {} releases lock", round);
            self.safety.locked_qc = self.safety.high_qc.clone();
        } else {
            info!("Polka for {} in round {} moves lock", qc.block_hash.short(), round);
            self.safety.locked_qc = qc.clone();
        }
        vec![Action::PersistSafety(self.safety.clone())]
    }

    /// Commit `hash` if it is the next height and its precommit QC is known
    fn try_commit(&mut self, hash: Hash) -> Result<Vec<Action>, ConsensusError> {
        let qc = match self.commit_qcs.get(&hash) {
            Some(qc) => qc.clone(),
            None => return Ok(Vec::new()),
        };
        let ready = self
            .tree
            .block(&hash)
            .is_some_and(|b| b.parent_hash == self.tree.root() && b.height == self.tree.root_height() + 1);
        if !ready {
            return Ok(Vec::new());
        }

        self.state.step = Step::Commit;
        info!("Decided block {} at {}", hash.short(), self.state);
        self.commit_qcs.remove(&hash);
        self.tree.record_qc(&qc);
        self.tree.advance_root(&hash);
        self.commits.enqueue(hash, qc.clone());
        if qc.view > self.safety.high_qc.view {
            self.safety.high_qc = qc;
        }

        let mut actions = self.commits.drain(&self.tree);
        actions.push(Action::PersistSafety(self.safety.clone()));
        actions.extend(self.enter_height()?);
        actions.extend(self.replay_parked(&hash));
        // A later height may already have its certificate
        let next = self
            .commit_qcs
            .iter()
            .find(|(h, _)| self.tree.block(h).is_some_and(|b| b.parent_hash == hash))
            .map(|(h, _)| *h);
        if let Some(next) = next {
            actions.extend(self.try_commit(next)?);
        }
        Ok(actions)
    }

    fn local_timeout(&mut self, kind: TimeoutKind) -> Result<Vec<Action>, ConsensusError> {
        match (kind, self.state.step) {
            (TimeoutKind::Propose, Step::Propose) => {
                warn!(
                    "No proposal from {} at {}, prevoting nil",
                    self.proposer(self.state.height, self.state.round).short(),
                    self.state
                );
                self.cast_prevote(Hash::ZERO)
            }
            (TimeoutKind::Prevote, Step::Prevote) => {
                debug!("Prevote timeout at {}", self.state);
                self.cast_precommit(Hash::ZERO)
            }
            (TimeoutKind::Precommit, Step::Precommit) => {
                debug!("Precommit timeout at {}", self.state);
                self.enter_round(self.state.round + 1)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn handle_block_response(&mut self, from: &PublicKey, proposal: Proposal) -> Result<Vec<Action>, ConsensusError> {
        let view = proposal.block.view;
        let hash = self.validate_proposal(None, view, &proposal)?;
        if self.tree.contains(&hash) {
            return Ok(Vec::new());
        }
        if proposal.block.height <= self.tree.root_height() {
            return Err(ConsensusError::StaleMessage {
                view,
                current: self.state.view(),
            });
        }
        let height = proposal.block.height;
        if height == self.state.height {
            self.round_proposals.entry(view).or_insert(hash);
        }
        self.accept_proposal(from, view, proposal, hash)
    }
}

impl CoreEngine for TbftEngine {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Tbft
    }

    fn start(&mut self) -> Vec<Action> {
        if self.running {
            return Vec::new();
        }
        self.running = true;
        info!(
            "Starting TBFT at height {} round {} as {} ({} validators)",
            self.state.height,
            self.state.round,
            self.keypair.public.short(),
            self.epochs.current().len()
        );
        let round = self.state.round;
        let result = self.enter_round(round);
        self.absorb(None, result)
    }

    fn stop(&mut self) -> Vec<Action> {
        if self.running {
            info!("Stopping TBFT at {}", self.state);
        }
        self.running = false;
        Vec::new()
    }

    fn on_receive_proposal(&mut self, sender: &PublicKey, view: u64, proposal: Proposal) -> Vec<Action> {
        if !self.running {
            return Vec::new();
        }
        let result = self.handle_proposal(sender, view, proposal);
        self.absorb(Some(sender), result)
    }

    fn on_receive_vote(&mut self, vote: Vote) -> Vec<Action> {
        if !self.running {
            return Vec::new();
        }
        let voter = vote.voter;
        let result = self.handle_vote(vote);
        self.absorb(Some(&voter), result)
    }

    fn on_receive_timeout(&mut self, msg: TimeoutMsg) -> Vec<Action> {
        self.faults.record(
            Some(&msg.voter),
            ConsensusError::malformed("timeout messages are not part of TBFT"),
        );
        Vec::new()
    }

    fn on_receive_qc(&mut self, qc: QuorumCertificate) -> Vec<Action> {
        if !self.running {
            return Vec::new();
        }
        let result = verify_qc(&qc, &self.epochs, &self.genesis_hash).and_then(|_| self.on_qc(qc));
        self.absorb(None, result)
    }

    fn on_local_timeout(&mut self, view: u64, kind: TimeoutKind) -> Vec<Action> {
        if !self.running || view != self.state.view() {
            return Vec::new();
        }
        let result = self.local_timeout(kind);
        self.absorb(None, result)
    }

    fn on_tx_pool_ready(&mut self) -> Vec<Action> {
        if !self.running || self.state.step != Step::Propose || !self.is_proposer() {
            return Vec::new();
        }
        let result = self.start_proposal();
        self.absorb(None, result)
    }

    fn on_batch_ready(&mut self, view: u64, txs: Vec<Transaction>) -> Vec<Action> {
        if self.batch_pending != Some(view) {
            return Vec::new();
        }
        self.batch_pending = None;
        let current = self.running
            && view == self.state.view()
            && self.state.step == Step::Propose
            && !self.round_proposals.contains_key(&view);
        if !current {
            return Vec::new();
        }
        let result = self.propose(txs);
        self.absorb(None, result)
    }

    fn on_execution_completed(&mut self, block_hash: Hash, outcome: Result<ExecutionOutcome, String>) -> Vec<Action> {
        if let Err(e) = &outcome {
            self.faults.record(
                None,
                ConsensusError::ExecutionFailure(format!("block {}: {}", block_hash.short(), e)),
            );
        }
        self.tree.set_outcome(&block_hash, outcome);

        let mut actions = Vec::new();
        if self.running {
            let result = self.maybe_prevote().and_then(|mut acts| {
                acts.extend(self.advance_from_prevote()?);
                Ok(acts)
            });
            actions.extend(self.absorb(None, result));
        }
        actions.extend(self.commits.drain(&self.tree));
        actions
    }

    fn on_commit_completed(&mut self, height: u64, block_hash: Hash, result: Result<(), String>) -> Vec<Action> {
        match result {
            Ok(()) => debug!("Stored block {} at height {}", block_hash.short(), height),
            Err(e) => error!("Failed to store block {} at height {}: {}", block_hash.short(), height, e),
        }
        Vec::new()
    }

    fn on_block_request(&mut self, from: &PublicKey, block_hash: Hash) -> Vec<Action> {
        let proposal = self.tree.get(&block_hash).map(|node| node.to_proposal());
        let result = self
            .signed(self.state.view(), MessagePayload::BlockResponse(proposal))
            .map(|message| vec![Action::Send { to: *from, message }]);
        self.absorb(None, result)
    }

    fn on_block_response(&mut self, from: &PublicKey, proposal: Option<Proposal>) -> Vec<Action> {
        let proposal = match proposal {
            Some(proposal) if self.running => proposal,
            _ => return Vec::new(),
        };
        let result = self.handle_block_response(from, proposal);
        self.absorb(Some(from), result)
    }

    fn on_validator_set_update(&mut self, set: ValidatorSet, activation_height: u64) -> Vec<Action> {
        self.epochs.schedule(set, activation_height);
        Vec::new()
    }

    fn status(&self) -> EngineStatus {
        let leader = self.proposer(self.state.height, self.state.round);
        EngineStatus {
            kind: ConsensusKind::Tbft,
            running: self.running,
            view: self.state.view(),
            round: self.state.round,
            epoch: self.epochs.epoch(),
            committed_height: self.commits.committed_height(),
            committed_hash: self.commits.committed_hash(),
            locked_view: self.locked_here().map(|qc| qc.view).unwrap_or(0),
            high_qc_view: self.safety.high_qc.view,
            last_voted_view: self.safety.last_voted_view,
            leader,
            is_leader: leader == self.keypair.public,
            consecutive_timeouts: u32::try_from(self.state.round).unwrap_or(u32::MAX),
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

    fn keys(n: u64) -> Vec<KeyPair> {
        (0..n).map(KeyPair::from_seed).collect()
    }

    fn config(kps: &[KeyPair], me: usize) -> EngineConfig {
        let genesis = GenesisConfig {
            chain_id: 3,
            timestamp: 0,
            validators: kps.iter().map(|k| ValidatorInfo::new(k.public, 1)).collect(),
            quorum_rule: QuorumRule::Byzantine,
        };
        EngineConfig::new(kps[me].clone(), genesis)
    }

    fn tx(seed: u64) -> Transaction {
        let kp = KeyPair::from_seed(500 + seed);
        Transaction::new_signed(kp.public, seed, 1, vec![1, 2, 3], &kp.secret).unwrap()
    }

    #[test]
    fn test_proposer_of_first_height_fetches() {
        let kps = keys(4);
        // Height 1, round 0 is slot 1
        let mut proposer = TbftEngine::new(config(&kps, 1)).unwrap();
        let actions = proposer.start();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ScheduleTimeout { kind: TimeoutKind::Propose, .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::FetchBatch { .. })));
        assert_eq!(proposer.round_state().step, Step::Propose);

        let mut other = TbftEngine::new(config(&kps, 2)).unwrap();
        assert!(!other.start().iter().any(|a| matches!(a, Action::FetchBatch { .. })));
    }

    #[test]
    fn test_propose_timeout_prevotes_nil() {
        let kps = keys(4);
        let mut engine = TbftEngine::new(config(&kps, 0)).unwrap();
        engine.start();
        let view = engine.round_state().view();

        let actions = engine.on_local_timeout(view, TimeoutKind::Propose);
        let prevote = actions.iter().find_map(|a| match a {
            Action::Broadcast(m) => match &m.payload {
                MessagePayload::Vote(v) => Some(v.clone()),
                _ => None,
            },
            _ => None,
        });
        let prevote = prevote.unwrap();
        assert_eq!(prevote.phase, VotePhase::Prevote);
        assert!(prevote.is_nil());
        assert_eq!(engine.round_state().step, Step::Prevote);
        assert_eq!(engine.safety_state().last_voted_view, view);
    }

    #[test]
    fn test_proposal_executes_then_prevotes() {
        let kps = keys(4);
        let mut proposer = TbftEngine::new(config(&kps, 1)).unwrap();
        proposer.start();
        let view = proposer.round_state().view();
        let actions = proposer.on_batch_ready(view, vec![tx(1)]);

        let (block, txs) = actions
            .iter()
            .find_map(|a| match a {
                Action::Execute { block, txs } => Some((block.clone(), txs.clone())),
                _ => None,
            })
            .unwrap();
        // No prevote before execution finishes
        assert!(!proposer.round_state().prevoted);

        let hash = block.hash().unwrap();
        let outcome = ExecutionOutcome {
            state_root: Hash::ZERO,
            results: vec![],
        };
        let actions = proposer.on_execution_completed(hash, Ok(outcome));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast(m) if matches!(&m.payload, MessagePayload::Vote(v) if v.block_hash == hash)
        )));
        assert_eq!(txs.len(), 1);
    }

    #[test]
    fn test_restart_skips_voted_round() {
        let kps = keys(4);
        let mut cfg = config(&kps, 0);
        let genesis_hash = cfg.genesis.create_genesis_block().hash().unwrap();
        let mut state = SafetyState::genesis(genesis_hash);
        state.last_voted_view = encode_view(1, 2);
        cfg.safety_state = Some(state);

        let engine = TbftEngine::new(cfg).unwrap();
        assert_eq!(engine.round_state().height, 1);
        assert_eq!(engine.round_state().round, 3);
    }

    #[test]
    fn test_round_holds_at_limit() {
        let kps = keys(4);
        let mut cfg = config(&kps, 0);
        let genesis_hash = cfg.genesis.create_genesis_block().hash().unwrap();
        let mut state = SafetyState::genesis(genesis_hash);
        state.last_voted_view = encode_view(1, MAX_ROUND - 1);
        cfg.safety_state = Some(state);

        let mut engine = TbftEngine::new(cfg).unwrap();
        engine.start();
        assert_eq!(engine.round_state().round, MAX_ROUND);
        let view = engine.round_state().view();

        assert!(engine.enter_round(MAX_ROUND + 1).unwrap().is_empty());
        assert_eq!(engine.round_state().round, MAX_ROUND);
        assert_eq!(engine.round_state().view(), view);
    }

    #[test]
    fn test_restart_past_round_limit_is_rejected() {
        let kps = keys(4);
        let mut cfg = config(&kps, 0);
        let genesis_hash = cfg.genesis.create_genesis_block().hash().unwrap();
        let mut state = SafetyState::genesis(genesis_hash);
        state.last_voted_view = encode_view(1, MAX_ROUND);
        cfg.safety_state = Some(state);

        assert!(matches!(
            TbftEngine::new(cfg),
            Err(ConsensusError::ConfigurationFault(_))
        ));
    }

    #[test]
    fn test_timeout_messages_are_faults() {
        let kps = keys(4);
        let mut engine = TbftEngine::new(config(&kps, 0)).unwrap();
        engine.start();
        let msg = TimeoutMsg::new_signed(1, 0, QuorumCertificate::genesis(engine.genesis_hash), &kps[1]).unwrap();
        assert!(engine.on_receive_timeout(msg).is_empty());
        assert_eq!(engine.status().faults, 1);
    }
}
