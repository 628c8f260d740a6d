//! In-process cluster for driving engines without a runtime.
//!
//! Messages go through one FIFO queue, execution and storage answer
//! immediately and timers only fire when a test asks for it, so every run
//! is deterministic.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use tessera_consensus::{
    Action, BlockCommittedEvent, CoreEngine, EngineConfig, EngineRegistry, EngineStatus, Event, ExecutionOutcome,
    SafetyState, TimeoutKind, TxResult,
};
use tessera_core::crypto::hash_pair;
use tessera_core::{
    Block, CommittedBlock, ConsensusMessage, GenesisConfig, Hash, KeyPair, MessagePayload, Proposal,
    QuorumCertificate, QuorumRule, Transaction, ValidatorInfo, ValidatorSet,
};

/// Upper bound on queued events processed by one `run`
const MAX_STEPS: usize = 200_000;

pub struct Node {
    pub keypair: KeyPair,
    pub engine: Box<dyn CoreEngine>,
    pub pool: Vec<Transaction>,
    pub committed: Vec<CommittedBlock>,
    pub events: Vec<BlockCommittedEvent>,
    pub safety: Option<SafetyState>,
    pub timers: HashMap<TimeoutKind, u64>,
    pub crashed: bool,
}

impl Node {
    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    pub fn committed_hashes(&self) -> Vec<Hash> {
        self.committed.iter().map(|c| c.hash().unwrap()).collect()
    }

    pub fn has_committed(&self, tx: &Transaction) -> bool {
        let wanted = tx.hash().unwrap();
        self.committed
            .iter()
            .flat_map(|c| c.txs.iter())
            .any(|t| t.hash().unwrap() == wanted)
    }
}

pub struct Cluster {
    pub nodes: Vec<Node>,
    pub genesis: GenesisConfig,
    queue: VecDeque<(usize, Event)>,
}

impl Cluster {
    /// `weights[i]` is validator i's voting weight; validator i signs with seed i
    pub fn new(kind: &str, weights: &[u64], quorum_rule: QuorumRule) -> Self {
        let keys: Vec<KeyPair> = (0..weights.len() as u64).map(KeyPair::from_seed).collect();
        let genesis = GenesisConfig {
            chain_id: 42,
            timestamp: 0,
            validators: keys
                .iter()
                .zip(weights)
                .map(|(k, w)| ValidatorInfo::new(k.public, *w))
                .collect(),
            quorum_rule,
        };
        let registry = EngineRegistry::with_defaults();
        let nodes = keys
            .into_iter()
            .map(|keypair| Node {
                engine: registry
                    .build(kind, EngineConfig::new(keypair.clone(), genesis.clone()))
                    .unwrap(),
                keypair,
                pool: Vec::new(),
                committed: Vec::new(),
                events: Vec::new(),
                safety: None,
                timers: HashMap::new(),
                crashed: false,
            })
            .collect();
        Cluster {
            nodes,
            genesis,
            queue: VecDeque::new(),
        }
    }

    pub fn uniform(kind: &str, n: usize) -> Self {
        Self::new(kind, &vec![1; n], QuorumRule::Byzantine)
    }

    pub fn crash(&mut self, index: usize) {
        self.nodes[index].crashed = true;
    }

    /// Bring a crashed node back with the state it had; messages sent
    /// while it was down are lost
    pub fn revive(&mut self, index: usize) {
        self.nodes[index].crashed = false;
        self.queue.push_back((index, Event::Start));
    }

    pub fn start(&mut self) {
        for i in 0..self.nodes.len() {
            if !self.nodes[i].crashed {
                self.queue.push_back((i, Event::Start));
            }
        }
        self.run();
    }

    /// Hand a transaction to every live node's pool
    pub fn submit(&mut self, tx: Transaction) {
        for i in 0..self.nodes.len() {
            if !self.nodes[i].crashed {
                self.nodes[i].pool.push(tx.clone());
                self.queue.push_back((i, Event::TxPoolReady));
            }
        }
    }

    pub fn live(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.crashed)
    }

    /// Deliver until nothing is left in flight
    pub fn run(&mut self) {
        let mut steps = 0;
        while let Some((target, event)) = self.queue.pop_front() {
            steps += 1;
            assert!(steps < MAX_STEPS, "cluster did not quiesce");
            if self.nodes[target].crashed {
                continue;
            }
            let actions = self.nodes[target].engine.handle(event);
            self.route(target, actions);
        }
    }

    /// Fire the live timer of every kind on every running node
    pub fn fire_timeouts(&mut self) {
        for i in 0..self.nodes.len() {
            if self.nodes[i].crashed {
                continue;
            }
            let mut timers: Vec<(TimeoutKind, u64)> = self.nodes[i].timers.drain().collect();
            timers.sort_by_key(|(kind, view)| (*view, kind.to_string()));
            for (kind, view) in timers {
                self.queue.push_back((i, Event::LocalTimeout { view, kind }));
            }
        }
        self.run();
    }

    /// Run, firing timeouts whenever the cluster stalls, until `done` holds.
    /// Returns false if it never did within `max_timeouts` rounds.
    pub fn run_until(&mut self, max_timeouts: usize, done: impl Fn(&Cluster) -> bool) -> bool {
        self.run();
        for _ in 0..max_timeouts {
            if done(self) {
                return true;
            }
            self.fire_timeouts();
        }
        done(self)
    }

    pub fn min_committed_height(&self) -> u64 {
        self.live().map(|n| n.status().committed_height).min().unwrap_or(0)
    }

    /// Deliver one message to one node, bypassing the sender's engine
    pub fn inject(&mut self, to: usize, msg: ConsensusMessage) {
        self.queue.push_back((to, Event::Message(msg)));
    }

    /// Hand every live node a validator set to switch to
    pub fn update_validator_set(&mut self, set: ValidatorSet, activation_height: u64) {
        for i in 0..self.nodes.len() {
            if !self.nodes[i].crashed {
                self.queue.push_back((
                    i,
                    Event::ValidatorSetUpdate {
                        set: set.clone(),
                        activation_height,
                    },
                ));
            }
        }
        self.run();
    }

    /// A height-1 proposal signed by validator `proposer`, sent under `view`
    pub fn first_block_proposal(&self, proposer: usize, view: u64, txs: Vec<Transaction>) -> ConsensusMessage {
        let genesis_hash = self.genesis.create_genesis_block().hash().unwrap();
        let keypair = &self.nodes[proposer].keypair;
        let block = Block {
            chain_id: self.genesis.chain_id,
            height: 1,
            view,
            epoch: 0,
            proposer: keypair.public,
            parent_hash: genesis_hash,
            payload_hash: Block::compute_payload_hash(&txs).unwrap(),
            timestamp: 1,
            justify_qc: QuorumCertificate::genesis(genesis_hash),
        };
        ConsensusMessage::new_signed(view, MessagePayload::Proposal(Proposal::new(block, txs)), keypair).unwrap()
    }

    /// No two nodes ever committed different blocks at the same height,
    /// and every node's chain is gapless from height 1
    pub fn assert_consistent(&self) {
        self.assert_single_chain();
        for node in &self.nodes {
            assert_eq!(node.status().equivocations, 0);
        }
    }

    pub fn assert_single_chain(&self) {
        for node in &self.nodes {
            for (i, committed) in node.committed.iter().enumerate() {
                assert_eq!(committed.height(), i as u64 + 1, "gap in committed chain");
            }
        }
        let longest = self
            .nodes
            .iter()
            .max_by_key(|n| n.committed.len())
            .map(|n| n.committed_hashes())
            .unwrap_or_default();
        for node in &self.nodes {
            let hashes = node.committed_hashes();
            assert_eq!(hashes[..], longest[..hashes.len()], "diverging committed chains");
        }
    }

    fn index_of(&self, id: &tessera_core::PublicKey) -> Option<usize> {
        self.nodes.iter().position(|n| n.keypair.public == *id)
    }

    fn route(&mut self, from: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(msg) => {
                    for to in 0..self.nodes.len() {
                        if to != from {
                            self.queue.push_back((to, Event::Message(msg.clone())));
                        }
                    }
                }
                Action::Send { to, message } => {
                    if let Some(to) = self.index_of(&to) {
                        self.queue.push_back((to, Event::Message(message)));
                    }
                }
                Action::ScheduleTimeout { view, kind, .. } => {
                    self.nodes[from].timers.insert(kind, view);
                }
                Action::FetchBatch { view, max_count, .. } => {
                    let txs = self.nodes[from].pool.iter().take(max_count).cloned().collect();
                    self.queue.push_back((from, Event::BatchReady { view, txs }));
                }
                Action::Execute { block, txs } => {
                    let block_hash = block.hash().unwrap();
                    let outcome = Ok(execute(&block, &txs));
                    self.queue
                        .push_back((from, Event::ExecutionCompleted { block_hash, outcome }));
                }
                Action::Commit(committed) => {
                    let height = committed.height();
                    let block_hash = committed.hash().unwrap();
                    let included: Vec<Hash> = committed.txs.iter().map(|tx| tx.hash().unwrap()).collect();
                    let node = &mut self.nodes[from];
                    node.pool.retain(|tx| !included.contains(&tx.hash().unwrap()));
                    node.committed.push(committed);
                    self.queue.push_back((
                        from,
                        Event::CommitCompleted {
                            height,
                            block_hash,
                            result: Ok(()),
                        },
                    ));
                }
                Action::Publish(event) => self.nodes[from].events.push(event),
                Action::PersistSafety(state) => self.nodes[from].safety = Some(state),
            }
        }
    }
}

fn execute(block: &Block, txs: &[Transaction]) -> ExecutionOutcome {
    ExecutionOutcome {
        state_root: hash_pair(&block.parent_hash, &block.payload_hash),
        results: txs
            .iter()
            .map(|tx| TxResult {
                tx_hash: tx.hash().unwrap(),
                success: true,
            })
            .collect(),
    }
}

pub fn tx(seed: u64) -> Transaction {
    let kp = KeyPair::from_seed(10_000 + seed);
    Transaction::new_signed(kp.public, seed, 10, format!("payload-{}", seed).into_bytes(), &kp.secret).unwrap()
}
