use async_trait::async_trait;
use tessera_core::CommittedBlock;
use tessera_state::{ChainStore, CommitOutcome, Storage};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ConsensusError;
use crate::safety::SafetyState;

const SAFETY_RECORD: &str = "consensus_safety";

/// Durable side of consensus: committed blocks and the voting record
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Idempotent for the block already stored at a height; a different
    /// block at that height is an error.
    async fn commit_block(&self, committed: &CommittedBlock) -> Result<(), ConsensusError>;

    async fn save_safety_state(&self, state: &SafetyState) -> Result<(), ConsensusError>;

    async fn load_safety_state(&self) -> Result<Option<SafetyState>, ConsensusError>;
}

#[async_trait]
impl<S: Storage + 'static> BlockStore for RwLock<ChainStore<S>> {
    async fn commit_block(&self, committed: &CommittedBlock) -> Result<(), ConsensusError> {
        let outcome = self.write().await.commit_block(committed)?;
        if outcome == CommitOutcome::AlreadyCommitted {
            debug!("Height {} was already stored", committed.height());
        }
        Ok(())
    }

    async fn save_safety_state(&self, state: &SafetyState) -> Result<(), ConsensusError> {
        self.write().await.save_record(SAFETY_RECORD, state)?;
        Ok(())
    }

    async fn load_safety_state(&self) -> Result<Option<SafetyState>, ConsensusError> {
        Ok(self.read().await.load_record(SAFETY_RECORD)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{GenesisConfig, Hash, KeyPair, QuorumRule, ValidatorInfo};
    use tessera_state::MemoryStorage;

    #[tokio::test]
    async fn test_safety_state_round_trip() {
        let genesis = GenesisConfig {
            chain_id: 1,
            timestamp: 0,
            validators: vec![ValidatorInfo::new(KeyPair::from_seed(0).public, 1)],
            quorum_rule: QuorumRule::Byzantine,
        }
        .create_genesis_block();
        let mut chain = ChainStore::open(MemoryStorage::new()).unwrap();
        chain.initialize(&genesis).unwrap();
        let store = RwLock::new(chain);

        assert!(store.load_safety_state().await.unwrap().is_none());

        let mut state = SafetyState::genesis(Hash::ZERO);
        state.last_voted_view = 12;
        store.save_safety_state(&state).await.unwrap();
        assert_eq!(store.load_safety_state().await.unwrap(), Some(state));
    }
}
