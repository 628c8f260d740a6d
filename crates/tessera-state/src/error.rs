use thiserror::Error;

use tessera_core::Hash;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Conflicting block at height {height}: stored {existing}, got {incoming}")]
    ConflictingBlock {
        height: u64,
        existing: Hash,
        incoming: Hash,
    },

    #[error("Non-sequential commit: expected height {expected}, got {got}")]
    NonSequentialHeight { expected: u64, got: u64 },

    #[error("Chain not initialized with a genesis block")]
    NotInitialized,

    #[error("Core error: {0}")]
    Core(#[from] tessera_core::CoreError),
}
