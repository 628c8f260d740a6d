use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::crypto::PublicKey;
use crate::error::CoreError;

/// How much voting weight makes a quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumRule {
    /// More than two thirds of total weight (tolerates f of 3f+1)
    #[default]
    Byzantine,
    /// More than half of total weight
    SimpleMajority,
}

impl QuorumRule {
    /// Widened to u128 so any total a `ValidatorSet` accepts is exact.
    /// The result never exceeds `total_weight`.
    pub fn threshold(&self, total_weight: u64) -> u64 {
        let total = u128::from(total_weight);
        let needed = match self {
            QuorumRule::Byzantine => total * 2 / 3 + 1,
            QuorumRule::SimpleMajority => total / 2 + 1,
        };
        u64::try_from(needed).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub id: PublicKey,
    pub weight: u64,
}

impl ValidatorInfo {
    pub fn new(id: PublicKey, weight: u64) -> Self {
        ValidatorInfo { id, weight }
    }
}

/// The validators of one epoch, in canonical index order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub epoch: u64,
    validators: Vec<ValidatorInfo>,
    pub quorum_rule: QuorumRule,
}

impl ValidatorSet {
    /// Build a validated set. Empty sets, zero weights and duplicate ids are rejected.
    pub fn new(
        epoch: u64,
        validators: Vec<ValidatorInfo>,
        quorum_rule: QuorumRule,
    ) -> Result<Self, CoreError> {
        if validators.is_empty() {
            return Err(CoreError::InvalidValidatorSet("empty validator set".into()));
        }

        let mut seen = HashSet::new();
        for v in &validators {
            if v.weight == 0 {
                return Err(CoreError::InvalidValidatorSet(format!(
                    "validator {} has zero weight",
                    v.id.short()
                )));
            }
            if !seen.insert(v.id) {
                return Err(CoreError::InvalidValidatorSet(format!(
                    "duplicate validator {}",
                    v.id.short()
                )));
            }
        }

        validators
            .iter()
            .try_fold(0u64, |acc, v| acc.checked_add(v.weight))
            .ok_or_else(|| CoreError::InvalidValidatorSet("total weight overflows".into()))?;

        Ok(ValidatorSet {
            epoch,
            validators,
            quorum_rule,
        })
    }

    /// Equal-weight set, the common case
    pub fn uniform(epoch: u64, ids: Vec<PublicKey>, quorum_rule: QuorumRule) -> Result<Self, CoreError> {
        let validators = ids.into_iter().map(|id| ValidatorInfo::new(id, 1)).collect();
        Self::new(epoch, validators, quorum_rule)
    }

    pub fn validators(&self) -> &[ValidatorInfo] {
        &self.validators
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn contains(&self, id: &PublicKey) -> bool {
        self.index_of(id).is_some()
    }

    pub fn index_of(&self, id: &PublicKey) -> Option<usize> {
        self.validators.iter().position(|v| &v.id == id)
    }

    pub fn weight_of(&self, id: &PublicKey) -> Option<u64> {
        self.validators.iter().find(|v| &v.id == id).map(|v| v.weight)
    }

    pub fn get(&self, index: usize) -> Option<&ValidatorInfo> {
        self.validators.get(index)
    }

    pub fn total_weight(&self) -> u64 {
        self.validators.iter().map(|v| v.weight).sum()
    }

    /// Minimum weight that forms a quorum under this set's rule
    pub fn quorum_threshold(&self) -> u64 {
        self.quorum_rule.threshold(self.total_weight())
    }

    /// Combined weight of the given signers; unknown ids count zero
    pub fn weight_of_signers<'a, I>(&self, signers: I) -> u64
    where
        I: IntoIterator<Item = &'a PublicKey>,
    {
        signers
            .into_iter()
            .filter_map(|id| self.weight_of(id))
            .fold(0u64, u64::saturating_add)
    }
}
