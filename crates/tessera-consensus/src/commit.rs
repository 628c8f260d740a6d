use std::collections::VecDeque;

use tessera_core::{CommittedBlock, Hash, QuorumCertificate};
use tracing::{error, info, warn};

use crate::block_tree::BlockTree;
use crate::engine::Action;
use crate::events::BlockCommittedEvent;

/// Decided blocks waiting for their execution outcome. Released strictly
/// in decision order, so storage and subscribers see heights in sequence.
#[derive(Debug)]
pub(crate) struct CommitPipeline {
    queue: VecDeque<(Hash, QuorumCertificate)>,
    committed_height: u64,
    committed_hash: Hash,
}

impl CommitPipeline {
    pub fn new(root_hash: Hash, root_height: u64) -> Self {
        CommitPipeline {
            queue: VecDeque::new(),
            committed_height: root_height,
            committed_hash: root_hash,
        }
    }

    pub fn enqueue(&mut self, hash: Hash, commit_qc: QuorumCertificate) {
        self.queue.push_back((hash, commit_qc));
    }

    /// Emit `Commit` and `Publish` for every decided block at the front of
    /// the queue whose execution has finished.
    pub fn drain(&mut self, tree: &BlockTree) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            let hash = match self.queue.front() {
                Some((hash, _)) => *hash,
                None => break,
            };
            let node = match tree.get(&hash) {
                Some(node) => node,
                None => {
                    warn!("Decided block {} is no longer known, skipping", hash.short());
                    self.queue.pop_front();
                    continue;
                }
            };
            if !node.is_executed() {
                break;
            }

            let state_root = match &node.outcome {
                Some(outcome) => outcome.state_root,
                None => {
                    error!(
                        "Committing block {} at height {} whose execution failed",
                        node.hash.short(),
                        node.block.height
                    );
                    Hash::ZERO
                }
            };
            let commit_qc = match self.queue.pop_front() {
                Some((_, qc)) => qc,
                None => break,
            };
            let committed = CommittedBlock {
                block: node.block.clone(),
                txs: node.txs.clone(),
                commit_qc,
                state_root,
            };

            info!(
                "Committed block {} at height {} ({} txs)",
                node.hash.short(),
                node.block.height,
                node.txs.len()
            );
            self.committed_height = node.block.height;
            self.committed_hash = node.hash;

            let event = BlockCommittedEvent::from_committed(&committed, node.hash);
            actions.push(Action::Commit(committed));
            actions.push(Action::Publish(event));
        }
        actions
    }

    pub fn committed_height(&self) -> u64 {
        self.committed_height
    }

    pub fn committed_hash(&self) -> Hash {
        self.committed_hash
    }
}
