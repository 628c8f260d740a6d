//! Tessera Mempool - Transaction pool
//!
//! Holds pending transactions and hands out size-bounded batches to
//! block proposers.

pub mod ordering;
pub mod pool;

pub use ordering::{OrderingMode, TxPriority};
pub use pool::{Mempool, MempoolConfig, MempoolError, PendingTransaction};
