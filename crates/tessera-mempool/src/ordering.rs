use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use tessera_core::Transaction;

/// Transaction priority for ordering. Larger sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TxPriority {
    /// Fee per encoded byte, scaled by 1000 so small fees still separate
    pub fee_rate: u64,
    /// Arrival sequence; earlier wins ties
    pub seq: Reverse<u64>,
}

impl TxPriority {
    pub fn from_transaction(tx: &Transaction, seq: u64) -> Self {
        let size = tx.encoded_size().max(1) as u64;
        TxPriority {
            fee_rate: tx.fee.saturating_mul(1000) / size,
            seq: Reverse(seq),
        }
    }
}

/// Ordering mode for transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// Order by fee rate (highest first)
    #[default]
    FeeRate,
    /// Order by arrival
    Fifo,
}
