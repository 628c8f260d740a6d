use serde::{Deserialize, Serialize};

use crate::crypto::{merkle_root, Hash, PublicKey};
use crate::error::CoreError;
use crate::serialize;
use crate::types::qc::QuorumCertificate;
use crate::types::timeout::TimeoutCertificate;
use crate::types::transaction::Transaction;
use crate::types::validator::{QuorumRule, ValidatorInfo, ValidatorSet};

/// A block as consensus sees it. Immutable once built; identified by
/// the blake3 hash of its bincode encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Chain identifier
    pub chain_id: u64,
    /// Block height (0 for genesis)
    pub height: u64,
    /// View in which the block was proposed
    pub view: u64,
    pub epoch: u64,
    /// Proposer's public key
    pub proposer: PublicKey,
    /// Hash of the parent block (zeros for genesis)
    pub parent_hash: Hash,
    /// Merkle root of the transaction batch
    pub payload_hash: Hash,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Certificate for the parent
    pub justify_qc: QuorumCertificate,
}

impl Block {
    /// Compute the block hash
    pub fn hash(&self) -> Result<Hash, CoreError> {
        serialize::digest(self)
    }

    /// Merkle root over the transaction hashes of a batch
    pub fn compute_payload_hash(txs: &[Transaction]) -> Result<Hash, CoreError> {
        let tx_hashes: Result<Vec<Hash>, _> = txs.iter().map(|tx| tx.hash()).collect();
        Ok(merkle_root(&tx_hashes?))
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.parent_hash.is_zero()
    }
}

/// A block together with its transaction batch, as sent by a leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub block: Block,
    pub txs: Vec<Transaction>,
    /// Present when the leader entered the view through a timeout
    pub timeout_cert: Option<TimeoutCertificate>,
}

impl Proposal {
    pub fn new(block: Block, txs: Vec<Transaction>) -> Self {
        Proposal {
            block,
            txs,
            timeout_cert: None,
        }
    }

    /// Verify that the batch matches the block's payload hash
    pub fn verify_payload(&self) -> Result<bool, CoreError> {
        Ok(Block::compute_payload_hash(&self.txs)? == self.block.payload_hash)
    }
}

/// A finalized block as handed to storage and subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedBlock {
    pub block: Block,
    pub txs: Vec<Transaction>,
    /// Certificate that finalized the block
    pub commit_qc: QuorumCertificate,
    /// State root reported by execution
    pub state_root: Hash,
}

impl CommittedBlock {
    pub fn height(&self) -> u64 {
        self.block.height
    }

    pub fn hash(&self) -> Result<Hash, CoreError> {
        self.block.hash()
    }
}

/// Genesis block configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: u64,
    pub timestamp: u64,
    pub validators: Vec<ValidatorInfo>,
    #[serde(default)]
    pub quorum_rule: QuorumRule,
}

impl GenesisConfig {
    /// Create the genesis block from this config
    pub fn create_genesis_block(&self) -> Block {
        Block {
            chain_id: self.chain_id,
            height: 0,
            view: 0,
            epoch: 0,
            proposer: PublicKey::default(),
            parent_hash: Hash::ZERO,
            payload_hash: Hash::ZERO,
            timestamp: self.timestamp,
            justify_qc: QuorumCertificate::genesis(Hash::ZERO),
        }
    }

    /// The epoch-0 validator set
    pub fn validator_set(&self) -> Result<ValidatorSet, CoreError> {
        ValidatorSet::new(0, self.validators.clone(), self.quorum_rule)
    }
}
