use ed25519_dalek::{Signature as DalekSignature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::fmt;

use crate::crypto::keys::{PublicKey, SecretKey};
use crate::error::CoreError;

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sig(#[serde(with = "BigArray")] pub [u8; 64]);

impl Sig {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 64] = slice.try_into().ok()?;
        Some(Sig(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for Sig {
    fn default() -> Self {
        Sig([0u8; 64])
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({}..)", hex::encode(&self.0[..8]))
    }
}

/// Sign a message with a secret key
pub fn sign(secret_key: &SecretKey, message: &[u8]) -> Sig {
    Sig(secret_key.signing_key().sign(message).to_bytes())
}

/// Verify a signature against a public key and message
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Sig) -> Result<(), CoreError> {
    let verifying_key = public_key.to_verifying_key()?;
    verifying_key
        .verify(message, &DalekSignature::from_bytes(&signature.0))
        .map_err(|_| CoreError::InvalidSignature)
}
