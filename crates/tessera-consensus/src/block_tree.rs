use std::collections::{BTreeMap, HashMap, HashSet};

use tessera_core::{Block, Hash, Proposal, QuorumCertificate, Transaction};
use tracing::debug;

use crate::error::ConsensusError;
use crate::execution::ExecutionOutcome;

/// Committed blocks kept in memory below the root, for serving block requests
pub const RETAINED_COMMITTED_BLOCKS: u64 = 64;

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub block: Block,
    pub hash: Hash,
    pub txs: Vec<Transaction>,
    /// Set once execution reports back
    pub outcome: Option<ExecutionOutcome>,
    pub execution_failed: bool,
}

impl TreeNode {
    pub fn is_executed(&self) -> bool {
        self.outcome.is_some() || self.execution_failed
    }

    pub fn to_proposal(&self) -> Proposal {
        Proposal::new(self.block.clone(), self.txs.clone())
    }
}

/// Blocks known to this replica, rooted at the last committed block.
/// Every non-root node's parent is in the tree.
#[derive(Debug)]
pub struct BlockTree {
    nodes: HashMap<Hash, TreeNode>,
    qcs: HashMap<Hash, QuorumCertificate>,
    committed: BTreeMap<u64, Hash>,
    root: Hash,
    root_height: u64,
}

impl BlockTree {
    pub fn new(genesis: Block) -> Result<Self, ConsensusError> {
        let hash = genesis.hash()?;
        Self::with_root(genesis, QuorumCertificate::genesis(hash))
    }

    /// Start from a committed block recovered from storage
    pub fn with_root(root: Block, commit_qc: QuorumCertificate) -> Result<Self, ConsensusError> {
        let hash = root.hash()?;
        let height = root.height;
        let mut nodes = HashMap::new();
        nodes.insert(
            hash,
            TreeNode {
                block: root,
                hash,
                txs: Vec::new(),
                outcome: None,
                execution_failed: false,
            },
        );
        let mut committed = BTreeMap::new();
        committed.insert(height, hash);
        let mut qcs = HashMap::new();
        qcs.insert(hash, commit_qc);

        Ok(BlockTree {
            nodes,
            qcs,
            committed,
            root: hash,
            root_height: height,
        })
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn root_height(&self) -> u64 {
        self.root_height
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&TreeNode> {
        self.nodes.get(hash)
    }

    pub fn block(&self, hash: &Hash) -> Option<&Block> {
        self.nodes.get(hash).map(|n| &n.block)
    }

    /// Insert a block whose parent is known. Returns false if it was
    /// already present.
    pub fn insert(&mut self, block: Block, txs: Vec<Transaction>) -> Result<bool, ConsensusError> {
        let hash = block.hash()?;
        if self.nodes.contains_key(&hash) {
            return Ok(false);
        }
        let parent = self
            .nodes
            .get(&block.parent_hash)
            .ok_or_else(|| ConsensusError::malformed(format!("unknown parent {}", block.parent_hash.short())))?;
        if block.height != parent.block.height + 1 {
            return Err(ConsensusError::malformed(format!(
                "height {} does not follow parent height {}",
                block.height, parent.block.height
            )));
        }
        if block.height <= self.root_height {
            return Err(ConsensusError::safety(format!(
                "block at height {} conflicts with committed height {}",
                block.height, self.root_height
            )));
        }
        self.nodes.insert(
            hash,
            TreeNode {
                block,
                hash,
                txs,
                outcome: None,
                execution_failed: false,
            },
        );
        Ok(true)
    }

    pub fn set_outcome(&mut self, hash: &Hash, outcome: Result<ExecutionOutcome, String>) {
        if let Some(node) = self.nodes.get_mut(hash) {
            match outcome {
                Ok(outcome) => node.outcome = Some(outcome),
                Err(_) => node.execution_failed = true,
            }
        }
    }

    /// Whether `descendant` is `ancestor` or has it on its parent chain
    pub fn extends(&self, descendant: &Hash, ancestor: &Hash) -> bool {
        let target_height = match self.nodes.get(ancestor) {
            Some(node) => node.block.height,
            None => return false,
        };
        let mut cursor = *descendant;
        loop {
            if &cursor == ancestor {
                return true;
            }
            match self.nodes.get(&cursor) {
                Some(node) if node.block.height > target_height => cursor = node.block.parent_hash,
                _ => return false,
            }
        }
    }

    pub fn record_qc(&mut self, qc: &QuorumCertificate) {
        let replace = self
            .qcs
            .get(&qc.block_hash)
            .map_or(true, |existing| qc.view > existing.view);
        if replace {
            self.qcs.insert(qc.block_hash, qc.clone());
        }
    }

    pub fn qc_for(&self, hash: &Hash) -> Option<&QuorumCertificate> {
        self.qcs.get(hash)
    }

    /// Uncommitted blocks from just above the root up to `tip`, in height
    /// order. Empty if `tip` does not descend from the root.
    pub fn uncommitted_chain(&self, tip: &Hash) -> Vec<Hash> {
        let mut chain = Vec::new();
        let mut cursor = *tip;
        while cursor != self.root {
            match self.nodes.get(&cursor) {
                Some(node) if node.block.height > self.root_height => {
                    chain.push(cursor);
                    cursor = node.block.parent_hash;
                }
                _ => return Vec::new(),
            }
        }
        chain.reverse();
        chain
    }

    /// Whether any uncommitted block on the path to `tip` carries transactions
    pub fn has_pending_payload(&self, tip: &Hash) -> bool {
        self.uncommitted_chain(tip)
            .iter()
            .filter_map(|h| self.nodes.get(h))
            .any(|n| !n.txs.is_empty())
    }

    /// Transactions on the path from `tip` back through retained history,
    /// committed blocks included. Leaders use it to avoid re-proposing.
    pub fn tx_hashes_on_path(&self, tip: &Hash) -> HashSet<Hash> {
        let mut hashes = HashSet::new();
        let mut cursor = self.nodes.get(tip);
        while let Some(node) = cursor {
            hashes.extend(node.txs.iter().filter_map(|tx| tx.hash().ok()));
            cursor = self.nodes.get(&node.block.parent_hash);
        }
        hashes
    }

    pub fn committed_hash(&self, height: u64) -> Option<Hash> {
        self.committed.get(&height).copied()
    }

    /// Move the root to `hash`, recording every block on the way as
    /// committed, then drop forks and old history.
    pub fn advance_root(&mut self, hash: &Hash) -> Vec<Hash> {
        let chain = self.uncommitted_chain(hash);
        for h in &chain {
            if let Some(node) = self.nodes.get(h) {
                self.committed.insert(node.block.height, *h);
            }
        }
        if let Some(node) = self.nodes.get(hash) {
            if !chain.is_empty() {
                self.root = *hash;
                self.root_height = node.block.height;
                self.prune();
            }
        }
        chain
    }

    fn prune(&mut self) {
        let floor = self.root_height.saturating_sub(RETAINED_COMMITTED_BLOCKS);
        self.committed.retain(|height, _| *height >= floor);

        let root = self.root;
        let root_height = self.root_height;
        let keep: Vec<Hash> = self
            .nodes
            .iter()
            .filter(|(hash, node)| {
                if node.block.height <= root_height {
                    self.committed.get(&node.block.height) == Some(*hash)
                } else {
                    self.extends(hash, &root)
                }
            })
            .map(|(hash, _)| *hash)
            .collect();

        let before = self.nodes.len();
        let mut kept = HashMap::with_capacity(keep.len());
        for hash in keep {
            if let Some(node) = self.nodes.remove(&hash) {
                kept.insert(hash, node);
            }
        }
        self.nodes = kept;
        let nodes = &self.nodes;
        self.qcs.retain(|hash, _| nodes.contains_key(hash));

        if before != self.nodes.len() {
            debug!(
                "Pruned {} blocks at root height {}",
                before - self.nodes.len(),
                root_height
            );
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
