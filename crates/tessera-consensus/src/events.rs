use serde::{Deserialize, Serialize};
use tessera_core::{CommittedBlock, Hash};

/// Emitted once per committed block, in height order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCommittedEvent {
    pub height: u64,
    pub block_hash: Hash,
    pub view: u64,
    pub proposer: tessera_core::PublicKey,
    pub tx_count: usize,
    pub state_root: Hash,
    pub commit_qc_view: u64,
    pub timestamp: u64,
}

impl BlockCommittedEvent {
    pub fn from_committed(committed: &CommittedBlock, block_hash: Hash) -> Self {
        BlockCommittedEvent {
            height: committed.block.height,
            block_hash,
            view: committed.block.view,
            proposer: committed.block.proposer,
            tx_count: committed.txs.len(),
            state_root: committed.state_root,
            commit_qc_view: committed.commit_qc.view,
            timestamp: committed.block.timestamp,
        }
    }
}

/// Receives commit notifications. Must not block; delivery is best effort.
pub trait BlockEventSink: Send + Sync {
    fn publish(&self, event: &BlockCommittedEvent);
}
