//! Chained HotStuff.
//!
//! One block per view, one vote per block. A QC for a block serves as the
//! prepare certificate for it, the pre-commit certificate for its parent
//! and the commit certificate for its grandparent, so a new decision can
//! land every view.

use std::collections::{BTreeMap, HashMap};

use tessera_core::{
    Block, ConsensusMessage, Hash, KeyPair, MessagePayload, Proposal, PublicKey, QuorumCertificate,
    TimeoutCertificate, TimeoutMsg, Transaction, ValidatorSet, Vote, VotePhase,
};
use tracing::{debug, error, info, warn};

use crate::aggregator::{TimeoutAggregator, VoteAggregator};
use crate::block_tree::BlockTree;
use crate::commit::CommitPipeline;
use crate::engine::{now_millis, Action, CoreEngine, EngineConfig, EngineStatus, TimeoutKind};
use crate::epoch::EpochManager;
use crate::error::ConsensusError;
use crate::evidence::{EquivocationEvidence, FaultTracker};
use crate::execution::ExecutionOutcome;
use crate::leader::LeaderRotation;
use crate::pacemaker::{Pacemaker, ViewCertificate};
use crate::qc::{verify_qc, verify_tc};
use crate::registry::ConsensusKind;
use crate::safety::{commit_candidate, SafetyRules, SafetyState};

/// Upper bound on proposals waiting for a missing parent, and on QCs
/// waiting for their block
const MAX_PARKED: usize = 64;

#[derive(Debug)]
struct Parked {
    from: PublicKey,
    hash: Hash,
    live_view: Option<u64>,
    proposal: Proposal,
}

pub struct HotStuffEngine {
    keypair: KeyPair,
    chain_id: u64,
    genesis_hash: Hash,
    epochs: EpochManager,
    rotation: LeaderRotation,
    max_batch_txs: usize,
    max_batch_bytes: usize,
    pacemaker: Pacemaker,
    safety: SafetyRules,
    tree: BlockTree,
    votes: VoteAggregator,
    timeout_votes: TimeoutAggregator,
    commits: CommitPipeline,
    faults: FaultTracker,
    running: bool,
    /// First valid proposal hash seen per view
    proposals_seen: BTreeMap<u64, Hash>,
    /// Highest view this replica proposed in
    proposed_view: u64,
    batch_pending: Option<u64>,
    /// Block we intend to vote for once it has executed
    pending_vote: Option<(u64, Hash)>,
    /// Validated proposals keyed by the parent they are waiting for
    parked: HashMap<Hash, Vec<Parked>>,
    parked_count: usize,
    pending_qcs: HashMap<Hash, QuorumCertificate>,
    /// Certificate that ended the previous view, if it timed out
    last_tc: Option<TimeoutCertificate>,
}

impl HotStuffEngine {
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

        let mut state = config
            .safety_state
            .clone()
            .unwrap_or_else(|| SafetyState::genesis(genesis_hash));
        if !tree.contains(&state.high_qc.block_hash) {
            if let Some(root_qc) = tree.qc_for(&tree.root()) {
                state.high_qc = root_qc.clone();
            }
        }
        let start_view = state.last_voted_view.max(state.high_qc.view) + 1;
        if config.safety_state.is_some() {
            info!(
                "Recovered safety state: last voted view {}, locked view {}, resuming at view {}",
                state.last_voted_view, state.locked_qc.view, start_view
            );
        }

        Ok(HotStuffEngine {
            chain_id: config.genesis.chain_id,
            genesis_hash,
            epochs: EpochManager::new(set),
            rotation: config.leader_rotation,
            max_batch_txs: config.max_batch_txs,
            max_batch_bytes: config.max_batch_bytes,
            pacemaker: Pacemaker::new(config.timeouts.view, start_view),
            safety: SafetyRules::new(state),
            commits: CommitPipeline::new(tree.root(), tree.root_height()),
            tree,
            votes: VoteAggregator::new(),
            timeout_votes: TimeoutAggregator::new(),
            faults: FaultTracker::new(),
            running: false,
            proposals_seen: BTreeMap::new(),
            proposed_view: 0,
            batch_pending: None,
            pending_vote: None,
            parked: HashMap::new(),
            parked_count: 0,
            pending_qcs: HashMap::new(),
            last_tc: None,
            keypair: config.keypair,
        })
    }

    pub fn safety_state(&self) -> &SafetyState {
        self.safety.state()
    }

    pub fn tree(&self) -> &BlockTree {
        &self.tree
    }

    fn current_view(&self) -> u64 {
        self.pacemaker.current_view()
    }

    fn leader_for(&self, view: u64) -> PublicKey {
        self.rotation.leader_at(view, self.epochs.current())
    }

    fn is_leader(&self, view: u64) -> bool {
        self.leader_for(view) == self.keypair.public
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

    fn view_timer(&self) -> Action {
        Action::ScheduleTimeout {
            view: self.current_view(),
            kind: TimeoutKind::View,
            duration: self.pacemaker.current_timeout(),
        }
    }

    fn enter_view(&mut self) -> Vec<Action> {
        let view = self.current_view();
        if self.epochs.maybe_activate(self.tree.root_height()) {
            info!("Validator set epoch {} active from view {}", self.epochs.epoch(), view);
        }

        // One view of grace: a leader that left its view on a TC can still
        // finish that view's QC from late votes
        let floor = view.saturating_sub(1);
        self.votes.prune(floor);
        self.timeout_votes.prune(floor);
        self.proposals_seen = self.proposals_seen.split_off(&floor);
        if matches!(self.pending_vote, Some((v, _)) if v < view) {
            self.pending_vote = None;
        }

        debug!("Entered view {} (leader {})", view, self.leader_for(view).short());
        let mut actions = vec![self.view_timer()];
        actions.extend(self.try_propose());
        actions
    }

    /// Leader of the current view that entered it through a QC or TC and
    /// has not proposed yet
    fn can_propose(&self) -> bool {
        let view = self.current_view();
        let entered = self.safety.high_qc().view + 1 == view
            || self.last_tc.as_ref().is_some_and(|tc| tc.view + 1 == view);
        self.running
            && entered
            && self.is_leader(view)
            && self.proposed_view < view
            && self.batch_pending != Some(view)
    }

    fn try_propose(&mut self) -> Vec<Action> {
        if !self.can_propose() {
            return Vec::new();
        }
        let view = self.current_view();
        self.batch_pending = Some(view);
        vec![Action::FetchBatch {
            view,
            max_count: self.max_batch_txs,
            max_bytes: self.max_batch_bytes,
        }]
    }

    fn propose(&mut self, view: u64, txs: Vec<Transaction>) -> Result<Vec<Action>, ConsensusError> {
        let high_qc = self.safety.high_qc().clone();
        let parent = match self.tree.block(&high_qc.block_hash) {
            Some(parent) => parent.clone(),
            None => {
                warn!("High QC block {} unknown, cannot propose", high_qc.block_hash.short());
                return Ok(Vec::new());
            }
        };

        // Skip transactions already carried by ancestors
        let in_flight = self.tree.tx_hashes_on_path(&high_qc.block_hash);
        let txs: Vec<Transaction> = txs
            .into_iter()
            .filter(|tx| tx.hash().map(|h| !in_flight.contains(&h)).unwrap_or(false))
            .collect();

        if txs.is_empty() && !self.tree.has_pending_payload(&high_qc.block_hash) {
            debug!("Nothing to propose in view {}", view);
            return Ok(Vec::new());
        }

        let block = Block {
            chain_id: self.chain_id,
            height: parent.height + 1,
            view,
            epoch: self.epochs.epoch(),
            proposer: self.keypair.public,
            parent_hash: high_qc.block_hash,
            payload_hash: Block::compute_payload_hash(&txs)?,
            timestamp: now_millis().max(parent.timestamp),
            justify_qc: high_qc.clone(),
        };
        let hash = block.hash()?;
        let timeout_cert = if high_qc.view + 1 == view {
            None
        } else {
            self.last_tc.clone()
        };
        let proposal = Proposal {
            block,
            txs,
            timeout_cert,
        };

        info!(
            "Proposing block {} at height {} in view {} ({} txs)",
            hash.short(),
            proposal.block.height,
            view,
            proposal.txs.len()
        );
        self.proposed_view = view;
        self.proposals_seen.insert(view, hash);

        let msg = self.signed(view, MessagePayload::Proposal(proposal.clone()))?;
        let mut actions = vec![Action::Broadcast(msg)];
        let me = self.keypair.public;
        actions.extend(self.accept_block(&me, proposal, Some(view), hash)?);
        Ok(actions)
    }

    /// Shape, leader and certificate checks. `live_view` is set for
    /// proposals received in real time, which must also justify their view.
    fn validate_block(&self, proposal: &Proposal, live_view: Option<u64>) -> Result<Hash, ConsensusError> {
        let block = &proposal.block;
        let hash = block.hash()?;

        if block.chain_id != self.chain_id {
            return Err(ConsensusError::malformed(format!("wrong chain id {}", block.chain_id)));
        }
        let set = self
            .epochs
            .get(block.epoch)
            .ok_or_else(|| ConsensusError::malformed(format!("unknown epoch {}", block.epoch)))?;
        if self.rotation.leader_at(block.view, set) != block.proposer {
            return Err(ConsensusError::malformed(format!(
                "{} is not the leader of view {}",
                block.proposer.short(),
                block.view
            )));
        }
        if !proposal.verify_payload()? {
            return Err(ConsensusError::malformed("payload hash mismatch"));
        }

        let justify = &block.justify_qc;
        if justify.block_hash != block.parent_hash {
            return Err(ConsensusError::malformed("justify QC does not certify the parent"));
        }
        if block.height != justify.height + 1 || justify.view >= block.view {
            return Err(ConsensusError::malformed(format!(
                "block height {} view {} inconsistent with justify height {} view {}",
                block.height, block.view, justify.height, justify.view
            )));
        }
        verify_qc(justify, &self.epochs, &self.genesis_hash)?;

        if let Some(view) = live_view {
            if block.view != view {
                return Err(ConsensusError::malformed(format!(
                    "block view {} sent under view {}",
                    block.view, view
                )));
            }
            if let Some(tc) = &proposal.timeout_cert {
                verify_tc(tc, &self.epochs, &self.genesis_hash)?;
            }
            if justify.view + 1 != view {
                let justified = proposal
                    .timeout_cert
                    .as_ref()
                    .is_some_and(|tc| tc.view + 1 == view && justify.view >= tc.high_qc.view);
                if !justified {
                    return Err(ConsensusError::malformed(format!(
                        "view {} justified by neither QC nor TC",
                        view
                    )));
                }
            }
        }
        Ok(hash)
    }

    fn handle_proposal(&mut self, sender: &PublicKey, view: u64, proposal: Proposal) -> Result<Vec<Action>, ConsensusError> {
        if proposal.block.proposer != *sender {
            return Err(ConsensusError::malformed("proposal relayed by non-proposer"));
        }
        if view < self.current_view() && proposal.block.height <= self.tree.root_height() {
            return Err(ConsensusError::StaleMessage {
                view,
                current: self.current_view(),
            });
        }
        let hash = self.validate_block(&proposal, Some(view))?;

        match self.proposals_seen.get(&view) {
            Some(seen) if *seen == hash => return Ok(Vec::new()),
            Some(seen) => {
                return Err(ConsensusError::Equivocation(Box::new(EquivocationEvidence::Proposal {
                    proposer: proposal.block.proposer,
                    view,
                    first: *seen,
                    second: hash,
                })));
            }
            None => {
                self.proposals_seen.insert(view, hash);
            }
        }

        self.accept_block(sender, proposal, Some(view), hash)
    }

    /// Insert an already validated block, or park it if its parent is missing
    fn accept_block(
        &mut self,
        from: &PublicKey,
        proposal: Proposal,
        live_view: Option<u64>,
        hash: Hash,
    ) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = Vec::new();
        let parent = proposal.block.parent_hash;

        if !self.tree.contains(&parent) {
            if live_view.is_some() {
                // The justify QC still proves its view is over
                actions.extend(self.process_qc(proposal.block.justify_qc.clone())?);
            }
            if self.park(*from, hash, live_view, proposal) {
                debug!("Requesting missing block {} from {}", parent.short(), from.short());
                let request = self.signed(self.current_view(), MessagePayload::BlockRequest { block_hash: parent })?;
                actions.push(Action::Send {
                    to: *from,
                    message: request,
                });
            }
            return Ok(actions);
        }

        let Proposal {
            block,
            txs,
            timeout_cert,
        } = proposal;
        let justify = block.justify_qc.clone();

        let inserted = self.tree.insert(block.clone(), txs.clone())?;
        if inserted {
            self.tree.record_qc(&justify);
            actions.push(Action::Execute { block, txs });
        }

        actions.extend(self.process_qc(justify)?);
        if let Some(view) = live_view {
            if let Some(tc) = timeout_cert {
                actions.extend(self.process_tc(tc)?);
            }
            if inserted && view == self.current_view() {
                actions.extend(self.prepare_vote(view, hash));
            }
        }

        if let Some(qc) = self.pending_qcs.remove(&hash) {
            actions.extend(self.process_qc(qc)?);
        }
        actions.extend(self.replay_parked(&hash));
        Ok(actions)
    }

    fn park(&mut self, from: PublicKey, hash: Hash, live_view: Option<u64>, proposal: Proposal) -> bool {
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
            hash,
            live_view,
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
            let result = self.accept_block(&child.from, child.proposal, child.live_view, child.hash);
            actions.extend(self.absorb(Some(&child.from), result));
        }
        actions
    }

    fn prepare_vote(&mut self, view: u64, hash: Hash) -> Vec<Action> {
        let block = match self.tree.block(&hash) {
            Some(block) => block.clone(),
            None => return Vec::new(),
        };
        if let Err(e) = self.safety.check_vote(&block, &hash, view, &self.tree) {
            self.faults.record(Some(&block.proposer), e);
            return Vec::new();
        }

        let executed = self.tree.get(&hash).is_some_and(|n| n.outcome.is_some());
        if executed {
            let result = self.cast_vote(view, hash);
            self.absorb(None, result)
        } else {
            self.pending_vote = Some((view, hash));
            Vec::new()
        }
    }

    fn cast_vote(&mut self, view: u64, hash: Hash) -> Result<Vec<Action>, ConsensusError> {
        let block = self
            .tree
            .block(&hash)
            .cloned()
            .ok_or_else(|| ConsensusError::safety(format!("voting on unknown block {}", hash.short())))?;
        // The rule may have changed while the block executed
        self.safety.check_vote(&block, &hash, view, &self.tree)?;

        let vote = Vote::new_signed(hash, view, block.height, VotePhase::Generic, block.epoch, &self.keypair)?;
        self.safety.record_vote(view);
        self.pending_vote = None;
        debug!("Voting for {} in view {}", hash.short(), view);

        let mut actions = vec![Action::PersistSafety(self.safety.state().clone())];
        if block.proposer == self.keypair.public {
            actions.extend(self.on_receive_vote(vote));
        } else {
            actions.push(Action::Send {
                to: block.proposer,
                message: self.signed(view, MessagePayload::Vote(vote))?,
            });
        }
        Ok(actions)
    }

    fn handle_vote(&mut self, vote: Vote) -> Result<Vec<Action>, ConsensusError> {
        if vote.phase != VotePhase::Generic {
            return Err(ConsensusError::malformed(format!("{} vote sent to HotStuff", vote.phase)));
        }
        let set = self
            .epochs
            .get(vote.epoch)
            .ok_or_else(|| ConsensusError::malformed(format!("vote for unknown epoch {}", vote.epoch)))?;
        if self.rotation.leader_at(vote.view, set) != self.keypair.public {
            debug!("Ignoring vote for view {}: not its leader", vote.view);
            return Ok(Vec::new());
        }

        match self.votes.add_vote(&vote, set)? {
            Some(qc) => self.on_qc_formed(qc),
            None => Ok(Vec::new()),
        }
    }

    fn on_qc_formed(&mut self, qc: QuorumCertificate) -> Result<Vec<Action>, ConsensusError> {
        info!(
            "Formed QC for {} at view {} ({} signers)",
            qc.block_hash.short(),
            qc.view,
            qc.signature_count()
        );
        let msg = self.signed(qc.view, MessagePayload::QcGossip(qc.clone()))?;
        let mut actions = vec![Action::Broadcast(msg)];
        actions.extend(self.process_qc(qc)?);
        Ok(actions)
    }

    /// Apply a verified QC: high QC, lock, commit rule and view advance
    fn process_qc(&mut self, qc: QuorumCertificate) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = Vec::new();

        if self.tree.contains(&qc.block_hash) {
            self.tree.record_qc(&qc);
            self.safety.update_high_qc(&qc);
            let locked = self.safety.update_lock(&qc, &self.tree);
            if let Some((decided, commit_qc)) = commit_candidate(&qc, &self.tree) {
                self.commit_through(decided, commit_qc);
                actions.extend(self.commits.drain(&self.tree));
            }
            if locked {
                actions.push(Action::PersistSafety(self.safety.state().clone()));
            }
        } else if qc.view > self.safety.high_qc().view && self.pending_qcs.len() < MAX_PARKED {
            self.pending_qcs.insert(qc.block_hash, qc.clone());
        }

        if self.pacemaker.advance_view(ViewCertificate::Quorum(qc.view)) {
            actions.extend(self.enter_view());
        }
        Ok(actions)
    }

    fn process_tc(&mut self, tc: TimeoutCertificate) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = self.process_qc(tc.high_qc.clone())?;
        let view = tc.view;
        if self.pacemaker.advance_view(ViewCertificate::Timeout(view)) {
            info!("View {} timed out, moving to view {}", view, self.current_view());
            self.last_tc = Some(tc);
            actions.extend(self.enter_view());
        }
        Ok(actions)
    }

    /// Decide `decided` and its uncommitted ancestors
    fn commit_through(&mut self, decided: Hash, commit_qc: QuorumCertificate) {
        let chain = self.tree.uncommitted_chain(&decided);
        let qcs: Vec<QuorumCertificate> = chain
            .iter()
            .map(|h| {
                if *h == decided {
                    commit_qc.clone()
                } else {
                    self.tree.qc_for(h).cloned().unwrap_or_else(|| commit_qc.clone())
                }
            })
            .collect();

        self.tree.advance_root(&decided);
        for (hash, qc) in chain.into_iter().zip(qcs) {
            self.commits.enqueue(hash, qc);
        }

        let root_height = self.tree.root_height();
        self.parked.retain(|_, waiting| {
            waiting.retain(|p| p.proposal.block.height > root_height);
            !waiting.is_empty()
        });
        self.parked_count = self.parked.values().map(Vec::len).sum();
    }

    fn local_timeout(&mut self, view: u64) -> Result<Vec<Action>, ConsensusError> {
        warn!(
            "View {} timed out waiting for leader {}",
            view,
            self.leader_for(view).short()
        );
        // No votes in a view this replica has given up on
        self.safety.record_vote(view);
        self.pending_vote = None;

        let msg = TimeoutMsg::new_signed(view, self.epochs.epoch(), self.safety.high_qc().clone(), &self.keypair)?;
        let mut actions = vec![
            Action::PersistSafety(self.safety.state().clone()),
            Action::Broadcast(self.signed(view, MessagePayload::Timeout(msg.clone()))?),
            self.view_timer(),
        ];
        actions.extend(self.handle_timeout(msg)?);
        Ok(actions)
    }

    fn handle_timeout(&mut self, msg: TimeoutMsg) -> Result<Vec<Action>, ConsensusError> {
        verify_qc(&msg.high_qc, &self.epochs, &self.genesis_hash)?;
        let set = self
            .epochs
            .get(msg.epoch)
            .ok_or_else(|| ConsensusError::malformed(format!("timeout for unknown epoch {}", msg.epoch)))?;
        let tc = self.timeout_votes.add_timeout(&msg, set)?;

        let mut actions = self.process_qc(msg.high_qc)?;
        if let Some(tc) = tc {
            actions.extend(self.process_tc(tc)?);
        }
        Ok(actions)
    }

    fn handle_qc(&mut self, qc: QuorumCertificate) -> Result<Vec<Action>, ConsensusError> {
        verify_qc(&qc, &self.epochs, &self.genesis_hash)?;
        let mut actions = Vec::new();
        if !self.tree.contains(&qc.block_hash) && qc.height > self.tree.root_height() {
            let set = self
                .epochs
                .get(qc.epoch)
                .ok_or_else(|| ConsensusError::malformed(format!("QC for unknown epoch {}", qc.epoch)))?;
            let leader = self.rotation.leader_at(qc.view, set);
            if leader != self.keypair.public {
                let request = self.signed(
                    self.current_view(),
                    MessagePayload::BlockRequest {
                        block_hash: qc.block_hash,
                    },
                )?;
                actions.push(Action::Send {
                    to: leader,
                    message: request,
                });
            }
        }
        actions.extend(self.process_qc(qc)?);
        Ok(actions)
    }

    fn handle_block_response(&mut self, from: &PublicKey, proposal: Proposal) -> Result<Vec<Action>, ConsensusError> {
        let hash = self.validate_block(&proposal, None)?;
        if self.tree.contains(&hash) {
            return Ok(Vec::new());
        }
        if proposal.block.height <= self.tree.root_height() {
            return Err(ConsensusError::StaleMessage {
                view: proposal.block.view,
                current: self.current_view(),
            });
        }
        self.accept_block(from, proposal, None, hash)
    }
}

impl CoreEngine for HotStuffEngine {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::HotStuff
    }

    fn start(&mut self) -> Vec<Action> {
        if self.running {
            return Vec::new();
        }
        self.running = true;
        info!(
            "Starting HotStuff at view {} as {} ({} validators)",
            self.current_view(),
            self.keypair.public.short(),
            self.epochs.current().len()
        );
        self.enter_view()
    }

    fn stop(&mut self) -> Vec<Action> {
        if self.running {
            info!("Stopping HotStuff at view {}", self.current_view());
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
        if !self.running {
            return Vec::new();
        }
        let voter = msg.voter;
        let result = self.handle_timeout(msg);
        self.absorb(Some(&voter), result)
    }

    fn on_receive_qc(&mut self, qc: QuorumCertificate) -> Vec<Action> {
        if !self.running {
            return Vec::new();
        }
        let result = self.handle_qc(qc);
        self.absorb(None, result)
    }

    fn on_local_timeout(&mut self, view: u64, kind: TimeoutKind) -> Vec<Action> {
        if !self.running || kind != TimeoutKind::View || view != self.current_view() {
            return Vec::new();
        }
        let result = self.local_timeout(view);
        self.absorb(None, result)
    }

    fn on_tx_pool_ready(&mut self) -> Vec<Action> {
        self.try_propose()
    }

    fn on_batch_ready(&mut self, view: u64, txs: Vec<Transaction>) -> Vec<Action> {
        if self.batch_pending != Some(view) {
            return Vec::new();
        }
        self.batch_pending = None;
        if !self.running || view != self.current_view() {
            return Vec::new();
        }
        let result = self.propose(view, txs);
        self.absorb(None, result)
    }

    fn on_execution_completed(&mut self, block_hash: Hash, outcome: Result<ExecutionOutcome, String>) -> Vec<Action> {
        if let Err(e) = &outcome {
            self.faults.record(
                None,
                ConsensusError::ExecutionFailure(format!("block {}: {}", block_hash.short(), e)),
            );
        }
        let succeeded = outcome.is_ok();
        self.tree.set_outcome(&block_hash, outcome);

        let mut actions = Vec::new();
        if let Some((view, pending)) = self.pending_vote {
            if pending == block_hash {
                self.pending_vote = None;
                if succeeded && self.running && view == self.current_view() {
                    let result = self.cast_vote(view, block_hash);
                    actions.extend(self.absorb(None, result));
                }
            }
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
        if proposal.is_none() {
            debug!("Cannot serve block {} to {}", block_hash.short(), from.short());
        }
        let result = self
            .signed(self.current_view(), MessagePayload::BlockResponse(proposal))
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
        let view = self.current_view();
        let leader = self.leader_for(view);
        EngineStatus {
            kind: ConsensusKind::HotStuff,
            running: self.running,
            view,
            round: 0,
            epoch: self.epochs.epoch(),
            committed_height: self.commits.committed_height(),
            committed_hash: self.commits.committed_hash(),
            locked_view: self.safety.locked_qc().view,
            high_qc_view: self.safety.high_qc().view,
            last_voted_view: self.safety.last_voted_view(),
            leader,
            is_leader: leader == self.keypair.public,
            consecutive_timeouts: self.pacemaker.consecutive_timeouts(),
            faults: self.faults.total(),
            equivocations: self.faults.evidence().len(),
        }
    }

    fn record_fault(&mut self, source: Option<&PublicKey>, error: ConsensusError) {
        self.faults.record(source, error);
    }
}
