use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::{
    CommittedBlock, ConsensusMessage, GenesisConfig, Hash, KeyPair, MessagePayload, Proposal, PublicKey,
    QuorumCertificate, TimeoutMsg, Transaction, ValidatorSet, Vote, Block,
};
use tracing::debug;

use crate::error::ConsensusError;
use crate::events::BlockCommittedEvent;
use crate::execution::ExecutionOutcome;
use crate::leader::LeaderRotation;
use crate::pacemaker::TimeoutPolicy;
use crate::registry::ConsensusKind;
use crate::safety::SafetyState;

/// Which timer fired. One timer per kind is live at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    View,
    Propose,
    Prevote,
    Precommit,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::View => write!(f, "view"),
            TimeoutKind::Propose => write!(f, "propose"),
            TimeoutKind::Prevote => write!(f, "prevote"),
            TimeoutKind::Precommit => write!(f, "precommit"),
        }
    }
}

/// Side effects requested by an engine. The runner carries them out;
/// engines themselves never touch the network, timers or storage.
#[derive(Debug, Clone)]
pub enum Action {
    /// Send to every other validator
    Broadcast(ConsensusMessage),
    Send { to: PublicKey, message: ConsensusMessage },
    /// Replace the live timer of this kind
    ScheduleTimeout {
        view: u64,
        kind: TimeoutKind,
        duration: Duration,
    },
    /// Pull a batch from the pool; answered with `Event::BatchReady`
    FetchBatch {
        view: u64,
        max_count: usize,
        max_bytes: usize,
    },
    /// Run the executor; answered with `Event::ExecutionCompleted`
    Execute { block: Block, txs: Vec<Transaction> },
    /// Hand to the ordered commit worker; answered with `Event::CommitCompleted`
    Commit(CommittedBlock),
    Publish(BlockCommittedEvent),
    /// Must be durable before any vote that follows it is sent
    PersistSafety(SafetyState),
}

/// Inputs to an engine, all delivered through one queue
#[derive(Debug, Clone)]
pub enum Event {
    Start,
    Message(ConsensusMessage),
    LocalTimeout { view: u64, kind: TimeoutKind },
    TxPoolReady,
    BatchReady { view: u64, txs: Vec<Transaction> },
    ExecutionCompleted {
        block_hash: Hash,
        outcome: Result<ExecutionOutcome, String>,
    },
    CommitCompleted {
        height: u64,
        block_hash: Hash,
        result: Result<(), String>,
    },
    ValidatorSetUpdate { set: ValidatorSet, activation_height: u64 },
    Stop,
}

/// Timer settings for both engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// HotStuff view timeout and its backoff
    pub view: TimeoutPolicy,
    pub propose_base_ms: u64,
    pub propose_delta_ms: u64,
    pub prevote_base_ms: u64,
    pub prevote_delta_ms: u64,
    pub precommit_base_ms: u64,
    pub precommit_delta_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            view: TimeoutPolicy::default(),
            propose_base_ms: 3000,
            propose_delta_ms: 500,
            prevote_base_ms: 1000,
            prevote_delta_ms: 500,
            precommit_base_ms: 1000,
            precommit_delta_ms: 500,
        }
    }
}

impl TimeoutConfig {
    /// TBFT step timeout: `base + delta * round`
    pub fn step_timeout(&self, kind: TimeoutKind, round: u64) -> Duration {
        let (base, delta) = match kind {
            TimeoutKind::Propose => (self.propose_base_ms, self.propose_delta_ms),
            TimeoutKind::Prevote => (self.prevote_base_ms, self.prevote_delta_ms),
            TimeoutKind::Precommit => (self.precommit_base_ms, self.precommit_delta_ms),
            TimeoutKind::View => return self.view.duration(0),
        };
        Duration::from_millis(base.saturating_add(delta.saturating_mul(round)))
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        self.view.validate()?;
        if self.propose_base_ms == 0 || self.prevote_base_ms == 0 || self.precommit_base_ms == 0 {
            return Err(ConsensusError::ConfigurationFault(
                "step timeouts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to build an engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub keypair: KeyPair,
    pub genesis: GenesisConfig,
    pub timeouts: TimeoutConfig,
    pub leader_rotation: LeaderRotation,
    pub max_batch_txs: usize,
    pub max_batch_bytes: usize,
    /// Voting record recovered from storage, if any
    pub safety_state: Option<SafetyState>,
    /// Last block already in storage; the engine resumes above it
    pub committed_head: Option<CommittedBlock>,
}

impl EngineConfig {
    pub fn new(keypair: KeyPair, genesis: GenesisConfig) -> Self {
        EngineConfig {
            keypair,
            genesis,
            timeouts: TimeoutConfig::default(),
            leader_rotation: LeaderRotation::default(),
            max_batch_txs: 1000,
            max_batch_bytes: 1 << 20,
            safety_state: None,
            committed_head: None,
        }
    }

    /// Construction-time checks shared by every engine
    pub fn validate(&self) -> Result<ValidatorSet, ConsensusError> {
        let set = self
            .genesis
            .validator_set()
            .map_err(|e| ConsensusError::ConfigurationFault(e.to_string()))?;
        if !set.contains(&self.keypair.public) {
            return Err(ConsensusError::ConfigurationFault(format!(
                "local key {} is not in the validator set",
                self.keypair.public.short()
            )));
        }
        if self.max_batch_txs == 0 || self.max_batch_bytes == 0 {
            return Err(ConsensusError::ConfigurationFault(
                "batch limits must be positive".into(),
            ));
        }
        self.timeouts.validate()?;
        Ok(set)
    }
}

/// Snapshot of an engine for status endpoints and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub kind: ConsensusKind,
    pub running: bool,
    pub view: u64,
    /// TBFT only; zero for HotStuff
    pub round: u64,
    pub epoch: u64,
    pub committed_height: u64,
    pub committed_hash: Hash,
    pub locked_view: u64,
    pub high_qc_view: u64,
    pub last_voted_view: u64,
    pub leader: PublicKey,
    pub is_leader: bool,
    pub consecutive_timeouts: u32,
    pub faults: u64,
    pub equivocations: usize,
}

/// The contract every consensus protocol satisfies.
///
/// Handlers run one at a time on the replica's event loop and return the
/// side effects they need. Faulty input is recorded and absorbed; no
/// handler fails.
pub trait CoreEngine: Send {
    fn kind(&self) -> ConsensusKind;

    fn start(&mut self) -> Vec<Action>;

    fn stop(&mut self) -> Vec<Action>;

    /// `view` is the envelope view the proposal was sent under
    fn on_receive_proposal(&mut self, sender: &PublicKey, view: u64, proposal: Proposal) -> Vec<Action>;

    fn on_receive_vote(&mut self, vote: Vote) -> Vec<Action>;

    fn on_receive_timeout(&mut self, msg: TimeoutMsg) -> Vec<Action>;

    fn on_receive_qc(&mut self, qc: QuorumCertificate) -> Vec<Action>;

    fn on_local_timeout(&mut self, view: u64, kind: TimeoutKind) -> Vec<Action>;

    fn on_tx_pool_ready(&mut self) -> Vec<Action>;

    fn on_batch_ready(&mut self, view: u64, txs: Vec<Transaction>) -> Vec<Action>;

    fn on_execution_completed(&mut self, block_hash: Hash, outcome: Result<ExecutionOutcome, String>) -> Vec<Action>;

    fn on_commit_completed(&mut self, height: u64, block_hash: Hash, result: Result<(), String>) -> Vec<Action>;

    fn on_block_request(&mut self, from: &PublicKey, block_hash: Hash) -> Vec<Action>;

    fn on_block_response(&mut self, from: &PublicKey, proposal: Option<Proposal>) -> Vec<Action>;

    fn on_validator_set_update(&mut self, set: ValidatorSet, activation_height: u64) -> Vec<Action>;

    fn status(&self) -> EngineStatus;

    fn record_fault(&mut self, source: Option<&PublicKey>, error: ConsensusError);

    /// Check the envelope and route the payload to its handler
    fn on_message(&mut self, msg: ConsensusMessage) -> Vec<Action> {
        if let Err(e) = msg.verify_signature() {
            self.record_fault(Some(&msg.sender), ConsensusError::malformed(format!("envelope: {}", e)));
            return Vec::new();
        }
        let sender = msg.sender;
        debug!("Received {} from {} (view {})", msg.payload.kind(), sender.short(), msg.view);

        match msg.payload {
            // Engines bind the sender to the round's proposer themselves
            MessagePayload::Proposal(proposal) => self.on_receive_proposal(&sender, msg.view, proposal),
            MessagePayload::Vote(vote) => {
                if vote.voter != sender {
                    self.record_fault(Some(&sender), ConsensusError::malformed("vote relayed by non-voter"));
                    return Vec::new();
                }
                self.on_receive_vote(vote)
            }
            MessagePayload::Timeout(timeout) => {
                if timeout.voter != sender {
                    self.record_fault(Some(&sender), ConsensusError::malformed("timeout relayed by non-voter"));
                    return Vec::new();
                }
                self.on_receive_timeout(timeout)
            }
            MessagePayload::QcGossip(qc) => self.on_receive_qc(qc),
            MessagePayload::BlockRequest { block_hash } => self.on_block_request(&sender, block_hash),
            MessagePayload::BlockResponse(proposal) => self.on_block_response(&sender, proposal),
        }
    }

    /// Dispatch one event from the runner's queue
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Start => self.start(),
            Event::Stop => self.stop(),
            Event::Message(msg) => self.on_message(msg),
            Event::LocalTimeout { view, kind } => self.on_local_timeout(view, kind),
            Event::TxPoolReady => self.on_tx_pool_ready(),
            Event::BatchReady { view, txs } => self.on_batch_ready(view, txs),
            Event::ExecutionCompleted { block_hash, outcome } => self.on_execution_completed(block_hash, outcome),
            Event::CommitCompleted {
                height,
                block_hash,
                result,
            } => self.on_commit_completed(height, block_hash, result),
            Event::ValidatorSetUpdate { set, activation_height } => {
                self.on_validator_set_update(set, activation_height)
            }
        }
    }
}

/// Current wall clock in milliseconds, for block timestamps
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{QuorumRule, ValidatorInfo};

    fn genesis(ids: &[PublicKey]) -> GenesisConfig {
        GenesisConfig {
            chain_id: 1,
            timestamp: 0,
            validators: ids.iter().map(|id| ValidatorInfo::new(*id, 1)).collect(),
            quorum_rule: QuorumRule::Byzantine,
        }
    }

    #[test]
    fn test_step_timeout_grows_per_round() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.step_timeout(TimeoutKind::Propose, 0), Duration::from_millis(3000));
        assert_eq!(timeouts.step_timeout(TimeoutKind::Prevote, 2), Duration::from_millis(2000));
    }

    #[test]
    fn test_config_rejects_foreign_key() {
        let local = KeyPair::from_seed(0);
        let config = EngineConfig::new(local.clone(), genesis(&[KeyPair::from_seed(1).public]));
        assert!(config.validate().unwrap_err().is_fatal());

        let config = EngineConfig::new(local.clone(), genesis(&[local.public]));
        assert_eq!(config.validate().unwrap().len(), 1);
    }

    #[test]
    fn test_config_rejects_empty_set_and_zero_limits() {
        let local = KeyPair::from_seed(0);
        assert!(EngineConfig::new(local.clone(), genesis(&[])).validate().is_err());

        let mut config = EngineConfig::new(local.clone(), genesis(&[local.public]));
        config.max_batch_txs = 0;
        assert!(config.validate().is_err());
    }
}
