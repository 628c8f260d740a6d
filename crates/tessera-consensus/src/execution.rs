use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_core::crypto::hash_pair;
use tessera_core::{Block, Hash, Transaction};

use crate::error::ConsensusError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub tx_hash: Hash,
    pub success: bool,
}

/// What execution reports back for a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub state_root: Hash,
    pub results: Vec<TxResult>,
}

/// Applies a block's transactions. Consensus only needs the state root
/// and a yes/no; what the transactions mean is up to the implementor.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(&self, block: &Block, txs: &[Transaction]) -> Result<ExecutionOutcome, ConsensusError>;
}

/// Stateless executor: checks transaction signatures and derives the
/// state root from the parent hash and payload hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestExecutor;

#[async_trait]
impl BlockExecutor for DigestExecutor {
    async fn execute(&self, block: &Block, txs: &[Transaction]) -> Result<ExecutionOutcome, ConsensusError> {
        let mut results = Vec::with_capacity(txs.len());
        for tx in txs {
            let tx_hash = tx.hash()?;
            if tx.verify_signature().is_err() {
                return Err(ConsensusError::ExecutionFailure(format!(
                    "transaction {} has an invalid signature",
                    tx_hash.short()
                )));
            }
            results.push(TxResult {
                tx_hash,
                success: true,
            });
        }

        Ok(ExecutionOutcome {
            state_root: hash_pair(&block.parent_hash, &block.payload_hash),
            results,
        })
    }
}
