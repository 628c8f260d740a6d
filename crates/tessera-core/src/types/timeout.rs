use serde::{Deserialize, Serialize};

use crate::crypto::{sign, verify, KeyPair, PublicKey, Sig};
use crate::error::CoreError;
use crate::serialize;
use crate::types::qc::QuorumCertificate;

/// Fields a timeout signature commits to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutData {
    pub view: u64,
    pub epoch: u64,
    pub high_qc_view: u64,
}

impl TimeoutData {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serialize::to_bytes(self)
    }
}

/// A validator's signed statement that `view` cannot complete,
/// carrying the highest QC it knows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutMsg {
    pub view: u64,
    pub epoch: u64,
    pub high_qc: QuorumCertificate,
    pub voter: PublicKey,
    pub signature: Sig,
}

impl TimeoutMsg {
    pub fn new_signed(
        view: u64,
        epoch: u64,
        high_qc: QuorumCertificate,
        keypair: &KeyPair,
    ) -> Result<Self, CoreError> {
        let data = TimeoutData {
            view,
            epoch,
            high_qc_view: high_qc.view,
        };
        let signature = sign(&keypair.secret, &data.signing_bytes()?);
        Ok(TimeoutMsg {
            view,
            epoch,
            high_qc,
            voter: keypair.public,
            signature,
        })
    }

    pub fn timeout_data(&self) -> TimeoutData {
        TimeoutData {
            view: self.view,
            epoch: self.epoch,
            high_qc_view: self.high_qc.view,
        }
    }

    pub fn verify_signature(&self) -> Result<(), CoreError> {
        verify(&self.voter, &self.timeout_data().signing_bytes()?, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSignature {
    pub validator_pubkey: PublicKey,
    /// The view of the high QC this signer reported
    pub high_qc_view: u64,
    pub signature: Sig,
}

/// A quorum of timeout messages for one view. Carries the highest QC
/// reported by any signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCertificate {
    pub view: u64,
    pub epoch: u64,
    pub high_qc: QuorumCertificate,
    pub signatures: Vec<TimeoutSignature>,
}

impl TimeoutCertificate {
    pub fn signers(&self) -> impl Iterator<Item = &PublicKey> {
        self.signatures.iter().map(|s| &s.validator_pubkey)
    }
}
