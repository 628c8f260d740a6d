use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, PublicKey, Sig};
use crate::types::vote::{VoteData, VotePhase};

/// A signature from a validator on a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSignature {
    pub validator_pubkey: PublicKey,
    pub signature: Sig,
}

/// Quorum certificate proving a quorum of validators voted for one block
/// in one view and phase.
///
/// Signatures are kept in validator-index order; each one signs the
/// [`VoteData`] rebuilt from the certificate's own fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    /// Hash of the block being certified
    pub block_hash: Hash,
    pub view: u64,
    pub height: u64,
    pub phase: VotePhase,
    /// Epoch of the validator set that signed it
    pub epoch: u64,
    /// Validator signatures
    pub signatures: Vec<ValidatorSignature>,
}

impl QuorumCertificate {
    /// The unsigned view-0 certificate that justifies the genesis block's children
    pub fn genesis(genesis_hash: Hash) -> Self {
        QuorumCertificate {
            block_hash: genesis_hash,
            view: 0,
            height: 0,
            phase: VotePhase::Generic,
            epoch: 0,
            signatures: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.view == 0 && self.height == 0 && self.signatures.is_empty()
    }

    pub fn vote_data(&self) -> VoteData {
        VoteData {
            block_hash: self.block_hash,
            view: self.view,
            height: self.height,
            phase: self.phase,
            epoch: self.epoch,
        }
    }

    pub fn signers(&self) -> impl Iterator<Item = &PublicKey> {
        self.signatures.iter().map(|s| &s.validator_pubkey)
    }

    /// Get the number of signatures
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_nil(&self) -> bool {
        self.block_hash.is_zero()
    }
}
