use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{sign, verify, Hash, KeyPair, PublicKey, Sig};
use crate::error::CoreError;
use crate::serialize;

/// Which voting step a vote belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VotePhase {
    /// The single vote kind of chained HotStuff
    Generic,
    Prevote,
    Precommit,
}

impl fmt::Display for VotePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VotePhase::Generic => write!(f, "generic"),
            VotePhase::Prevote => write!(f, "prevote"),
            VotePhase::Precommit => write!(f, "precommit"),
        }
    }
}

/// The fields a vote signature commits to. Quorum certificates are verified
/// by rebuilding this from the certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteData {
    pub block_hash: Hash,
    pub view: u64,
    pub height: u64,
    pub phase: VotePhase,
    pub epoch: u64,
}

impl VoteData {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serialize::to_bytes(self)
    }
}

/// A validator's signed vote for a block (or nil, the zero hash)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub block_hash: Hash,
    pub view: u64,
    pub height: u64,
    pub phase: VotePhase,
    pub epoch: u64,
    pub voter: PublicKey,
    pub signature: Sig,
}

impl Vote {
    pub fn new_signed(
        block_hash: Hash,
        view: u64,
        height: u64,
        phase: VotePhase,
        epoch: u64,
        keypair: &KeyPair,
    ) -> Result<Self, CoreError> {
        let data = VoteData {
            block_hash,
            view,
            height,
            phase,
            epoch,
        };
        let signature = sign(&keypair.secret, &data.signing_bytes()?);
        Ok(Vote {
            block_hash,
            view,
            height,
            phase,
            epoch,
            voter: keypair.public,
            signature,
        })
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

    pub fn verify_signature(&self) -> Result<(), CoreError> {
        verify(&self.voter, &self.vote_data().signing_bytes()?, &self.signature)
    }

    pub fn is_nil(&self) -> bool {
        self.block_hash.is_zero()
    }
}
