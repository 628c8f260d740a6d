use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tessera_core::{Hash, PublicKey, Transaction};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use crate::ordering::{OrderingMode, TxPriority};

/// Configuration for the mempool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfig {
    /// Maximum number of transactions in the pool
    pub max_size: usize,
    /// Maximum transactions per sender
    pub max_per_sender: usize,
    /// Transaction expiry time in seconds
    pub expiry_seconds: u64,
    #[serde(default)]
    pub ordering_mode: OrderingMode,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_size: 10_000,
            max_per_sender: 100,
            expiry_seconds: 3600,
            ordering_mode: OrderingMode::FeeRate,
        }
    }
}

/// A pending transaction in the mempool
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub tx: Transaction,
    pub hash: Hash,
    pub size: usize,
    pub priority: TxPriority,
    pub seq: u64,
    pub added_at: u64,
}

#[derive(Default)]
struct PoolInner {
    by_hash: HashMap<Hash, PendingTransaction>,
    by_sender: HashMap<PublicKey, HashSet<Hash>>,
    by_priority: BTreeMap<(TxPriority, Hash), ()>,
    next_seq: u64,
}

impl PoolInner {
    fn remove(&mut self, hash: &Hash) -> Option<PendingTransaction> {
        let pending = self.by_hash.remove(hash)?;
        if let Some(sender_txs) = self.by_sender.get_mut(&pending.tx.sender_pubkey) {
            sender_txs.remove(hash);
            if sender_txs.is_empty() {
                self.by_sender.remove(&pending.tx.sender_pubkey);
            }
        }
        self.by_priority.remove(&(pending.priority, *hash));
        Some(pending)
    }

    fn lowest_priority(&self) -> Option<(TxPriority, Hash)> {
        self.by_priority.keys().next().copied()
    }

    /// Pending transactions in proposal order
    fn ordered(&self, mode: OrderingMode) -> Vec<&PendingTransaction> {
        match mode {
            OrderingMode::FeeRate => self
                .by_priority
                .keys()
                .rev()
                .filter_map(|(_, hash)| self.by_hash.get(hash))
                .collect(),
            OrderingMode::Fifo => {
                let mut txs: Vec<_> = self.by_hash.values().collect();
                txs.sort_by_key(|p| p.seq);
                txs
            }
        }
    }
}

/// The transaction mempool
pub struct Mempool {
    config: MempoolConfig,
    inner: RwLock<PoolInner>,
    ready: Notify,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Mempool {
            config,
            inner: RwLock::new(PoolInner::default()),
            ready: Notify::new(),
        }
    }

    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    /// Add a signed transaction to the mempool
    pub async fn add(&self, tx: Transaction) -> Result<Hash, MempoolError> {
        tx.verify_signature()
            .map_err(|_| MempoolError::InvalidTransaction)?;
        let hash = tx.hash().map_err(|_| MempoolError::InvalidTransaction)?;

        let mut inner = self.inner.write().await;

        if inner.by_hash.contains_key(&hash) {
            return Err(MempoolError::AlreadyExists);
        }

        let sender_count = inner.by_sender.get(&tx.sender_pubkey).map_or(0, HashSet::len);
        if sender_count >= self.config.max_per_sender {
            return Err(MempoolError::SenderLimitReached);
        }

        let seq = inner.next_seq;
        let priority = TxPriority::from_transaction(&tx, seq);

        if inner.by_hash.len() >= self.config.max_size {
            match inner.lowest_priority() {
                Some((lowest_priority, lowest)) if lowest_priority < priority => {
                    inner.remove(&lowest);
                    warn!("Evicted lowest priority transaction {}", lowest.short());
                }
                _ => return Err(MempoolError::PoolFull),
            }
        }

        inner.next_seq += 1;
        let pending = PendingTransaction {
            size: tx.encoded_size(),
            hash,
            priority,
            seq,
            added_at: Self::current_timestamp(),
            tx,
        };
        inner
            .by_sender
            .entry(pending.tx.sender_pubkey)
            .or_default()
            .insert(hash);
        inner.by_priority.insert((priority, hash), ());
        inner.by_hash.insert(hash, pending);
        drop(inner);

        debug!("Added transaction {} to mempool", hash.short());
        self.ready.notify_one();
        Ok(hash)
    }

    /// Remove a transaction from the mempool
    pub async fn remove(&self, hash: &Hash) -> Option<Transaction> {
        self.inner.write().await.remove(hash).map(|p| p.tx)
    }

    /// Get a transaction by hash
    pub async fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.inner.read().await.by_hash.get(hash).map(|p| p.tx.clone())
    }

    pub async fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().await.by_hash.contains_key(hash)
    }

    /// Take a proposal batch: at most `max_count` transactions whose encoded
    /// sizes sum to at most `max_bytes`, in priority order. Transactions stay
    /// in the pool until [`Mempool::remove_committed`] drops them.
    pub async fn fetch_batch(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        let inner = self.inner.read().await;
        let mut batch = Vec::new();
        let mut used = 0usize;

        for pending in inner.ordered(self.config.ordering_mode) {
            if batch.len() >= max_count {
                break;
            }
            if used + pending.size > max_bytes {
                continue;
            }
            used += pending.size;
            batch.push(pending.tx.clone());
        }

        batch
    }

    /// Remove transactions that have been included in a committed block
    pub async fn remove_committed(&self, tx_hashes: &[Hash]) {
        let mut inner = self.inner.write().await;
        for hash in tx_hashes {
            if inner.remove(hash).is_some() {
                debug!("Removed committed transaction {}", hash.short());
            }
        }
    }

    /// Remove expired transactions
    pub async fn remove_expired(&self) {
        let threshold = Self::current_timestamp().saturating_sub(self.config.expiry_seconds);
        let mut inner = self.inner.write().await;

        let expired: Vec<Hash> = inner
            .by_hash
            .iter()
            .filter(|(_, p)| p.added_at < threshold)
            .map(|(h, _)| *h)
            .collect();

        for hash in expired {
            inner.remove(&hash);
            warn!("Removed expired transaction {}", hash.short());
        }
    }

    pub async fn size(&self) -> usize {
        self.inner.read().await.by_hash.len()
    }

    /// Resolves once a transaction has been added since the last wakeup
    pub async fn wait_ready(&self) {
        self.ready.notified().await;
    }
}

/// Mempool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum MempoolError {
    #[error("Transaction already exists in mempool")]
    AlreadyExists,

    #[error("Mempool is full")]
    PoolFull,

    #[error("Sender has reached transaction limit")]
    SenderLimitReached,

    #[error("Invalid transaction")]
    InvalidTransaction,
}
