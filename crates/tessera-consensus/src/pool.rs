use async_trait::async_trait;
use tessera_core::{Hash, Transaction};
use tessera_mempool::Mempool;

/// Where leaders take transactions from
#[async_trait]
pub trait TxPool: Send + Sync {
    /// Highest-priority transactions within both limits. Does not remove them.
    async fn fetch_batch(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction>;

    async fn remove_committed(&self, tx_hashes: &[Hash]);

    /// Resolves when transactions may be available
    async fn wait_ready(&self);
}

#[async_trait]
impl TxPool for Mempool {
    async fn fetch_batch(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        Mempool::fetch_batch(self, max_count, max_bytes).await
    }

    async fn remove_committed(&self, tx_hashes: &[Hash]) {
        Mempool::remove_committed(self, tx_hashes).await
    }

    async fn wait_ready(&self) {
        Mempool::wait_ready(self).await
    }
}
