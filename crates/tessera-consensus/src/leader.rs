use serde::{Deserialize, Serialize};
use tessera_core::{PublicKey, ValidatorSet};

/// How leadership rotates over the validator set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderRotation {
    /// One slot per validator, in index order
    #[default]
    RoundRobin,
    /// Slots proportional to voting weight
    Weighted,
}

impl LeaderRotation {
    /// Leader for the slot `index` (a view, or `height + round`).
    /// Pure function of its inputs, so every replica agrees.
    pub fn leader_at(&self, index: u64, set: &ValidatorSet) -> PublicKey {
        let validators = set.validators();
        match self {
            LeaderRotation::RoundRobin => validators[(index % validators.len() as u64) as usize].id,
            LeaderRotation::Weighted => {
                let mut slot = index % set.total_weight();
                for v in validators {
                    if slot < v.weight {
                        return v.id;
                    }
                    slot -= v.weight;
                }
                validators[0].id
            }
        }
    }

    pub fn is_leader(&self, index: u64, set: &ValidatorSet, id: &PublicKey) -> bool {
        &self.leader_at(index, set) == id
    }
}
