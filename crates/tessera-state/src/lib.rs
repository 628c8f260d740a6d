//! Tessera State - Block storage
//!
//! Key-value storage abstractions and the chain store that persists
//! committed blocks and consensus safety records.

pub mod chain;
pub mod error;
pub mod storage;

pub use chain::{ChainStore, CommitOutcome};
pub use error::StateError;
pub use storage::{FileStorage, MemoryStorage, Storage};
