use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use tessera_core::{serialize, Block, CommittedBlock, Hash, QuorumCertificate};

use crate::error::StateError;
use crate::storage::Storage;

const HEAD_KEY: &[u8] = b"meta:head";

fn block_key(height: u64) -> Vec<u8> {
    format!("block:{:020}", height).into_bytes()
}

fn hash_index_key(hash: &Hash) -> Vec<u8> {
    format!("hash:{}", hash.to_hex()).into_bytes()
}

fn record_key(name: &str) -> Vec<u8> {
    format!("record:{}", name).into_bytes()
}

/// Result of a commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Stored,
    /// The same block was already stored at this height
    AlreadyCommitted,
}

/// Append-only store of committed blocks over a [`Storage`] backend.
///
/// Commits are idempotent: re-committing the stored block at a height is a
/// no-op, while a different block at a stored height is an error.
pub struct ChainStore<S: Storage> {
    storage: S,
    head: Option<u64>,
}

impl<S: Storage> ChainStore<S> {
    /// Open a store, recovering the head height from the backend
    pub fn open(storage: S) -> Result<Self, StateError> {
        let head = match storage.get(HEAD_KEY) {
            Some(bytes) => Some(
                serialize::from_bytes::<u64>(&bytes)
                    .map_err(|e| StateError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        if let Some(height) = head {
            info!("Opened chain store at height {}", height);
        }
        Ok(ChainStore { storage, head })
    }

    /// Store the genesis block if the chain is empty. A different genesis
    /// than the stored one is a conflict.
    pub fn initialize(&mut self, genesis: &Block) -> Result<CommitOutcome, StateError> {
        let genesis_hash = genesis.hash()?;
        self.commit_block(&CommittedBlock {
            block: genesis.clone(),
            txs: Vec::new(),
            commit_qc: QuorumCertificate::genesis(genesis_hash),
            state_root: Hash::ZERO,
        })
    }

    pub fn commit_block(&mut self, committed: &CommittedBlock) -> Result<CommitOutcome, StateError> {
        let height = committed.height();
        let hash = committed.hash()?;

        if let Some(existing) = self.get_block(height)? {
            let existing_hash = existing.hash()?;
            if existing_hash == hash {
                debug!("Block {} at height {} already committed", hash.short(), height);
                return Ok(CommitOutcome::AlreadyCommitted);
            }
            return Err(StateError::ConflictingBlock {
                height,
                existing: existing_hash,
                incoming: hash,
            });
        }

        let expected = self.head.map_or(0, |h| h + 1);
        if height != expected {
            return Err(StateError::NonSequentialHeight {
                expected,
                got: height,
            });
        }

        let bytes =
            serialize::to_bytes(committed).map_err(|e| StateError::Serialization(e.to_string()))?;
        let height_bytes =
            serialize::to_bytes(&height).map_err(|e| StateError::Serialization(e.to_string()))?;

        self.storage.put(&block_key(height), &bytes);
        self.storage.put(&hash_index_key(&hash), &height_bytes);
        self.storage.put(HEAD_KEY, &height_bytes);
        if let Err(e) = self.storage.commit() {
            self.storage.rollback();
            return Err(e);
        }

        self.head = Some(height);
        debug!("Stored block {} at height {}", hash.short(), height);
        Ok(CommitOutcome::Stored)
    }

    pub fn head_height(&self) -> Option<u64> {
        self.head
    }

    pub fn head(&self) -> Result<Option<CommittedBlock>, StateError> {
        match self.head {
            Some(height) => self.get_block(height),
            None => Ok(None),
        }
    }

    pub fn get_block(&self, height: u64) -> Result<Option<CommittedBlock>, StateError> {
        match self.storage.get(&block_key(height)) {
            Some(bytes) => serialize::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StateError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<CommittedBlock>, StateError> {
        match self.storage.get(&hash_index_key(hash)) {
            Some(bytes) => {
                let height: u64 = serialize::from_bytes(&bytes)
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                self.get_block(height)
            }
            None => Ok(None),
        }
    }

    /// Persist a named record (consensus safety state and the like)
    pub fn save_record<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), StateError> {
        let bytes =
            serialize::to_bytes(value).map_err(|e| StateError::Serialization(e.to_string()))?;
        self.storage.put(&record_key(name), &bytes);
        if let Err(e) = self.storage.commit() {
            self.storage.rollback();
            return Err(e);
        }
        Ok(())
    }

    pub fn load_record<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StateError> {
        match self.storage.get(&record_key(name)) {
            Some(bytes) => serialize::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StateError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}
