//! Tessera Consensus - Pluggable BFT engines
//!
//! Two BFT protocols behind one `CoreEngine` contract: chained HotStuff and
//! a Tendermint-style round protocol (TBFT), plus a single-validator SOLO
//! engine for development chains. Engines are pure state machines that
//! turn events into actions; `ConsensusRunner` performs those actions
//! against the network, the pool, the executor and storage.

pub mod aggregator;
pub mod block_tree;
mod commit;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod events;
pub mod evidence;
pub mod execution;
pub mod hotstuff;
pub mod leader;
pub mod net;
pub mod pacemaker;
pub mod pool;
pub mod qc;
pub mod registry;
pub mod runner;
pub mod safety;
pub mod solo;
pub mod store;
pub mod tbft;

pub use aggregator::{TimeoutAggregator, VoteAggregator};
pub use block_tree::{BlockTree, TreeNode};
pub use engine::{Action, CoreEngine, EngineConfig, EngineStatus, Event, TimeoutConfig, TimeoutKind};
pub use epoch::EpochManager;
pub use error::ConsensusError;
pub use events::{BlockCommittedEvent, BlockEventSink};
pub use evidence::{EquivocationEvidence, EvidenceLog, FaultTracker};
pub use execution::{BlockExecutor, DigestExecutor, ExecutionOutcome, TxResult};
pub use hotstuff::HotStuffEngine;
pub use leader::LeaderRotation;
pub use net::{HttpNetwork, MessageAck, Network, ValidatorEndpoint, MESSAGE_PATH};
pub use pacemaker::{Pacemaker, TimeoutPolicy, ViewCertificate};
pub use pool::TxPool;
pub use qc::{verify_qc, verify_tc};
pub use registry::{ConsensusKind, EngineConstructor, EngineRegistry};
pub use runner::{Collaborators, ConsensusRunner, RunnerConfig, RunnerHandle};
pub use safety::{SafetyRules, SafetyState};
pub use solo::SoloEngine;
pub use store::BlockStore;
pub use tbft::TbftEngine;
