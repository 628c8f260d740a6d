use serde::{Deserialize, Serialize};

use crate::crypto::{hash_blake3, sign, verify, Hash, PublicKey, SecretKey, Sig};
use crate::error::CoreError;
use crate::serialize;

/// An opaque client transaction. Consensus orders it; execution gives it meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender's public key
    pub sender_pubkey: PublicKey,
    /// Sender-scoped sequence number
    pub nonce: u64,
    /// Fee offered for inclusion
    pub fee: u64,
    /// Application payload, uninterpreted by consensus
    pub payload: Vec<u8>,
    /// Signature over the transaction (excluding this field)
    pub signature: Sig,
}

/// Transaction data for signing (excludes signature field)
#[derive(Serialize)]
struct TransactionSigningData<'a> {
    sender_pubkey: &'a PublicKey,
    nonce: u64,
    fee: u64,
    payload: &'a [u8],
}

impl Transaction {
    /// Create a new unsigned transaction
    pub fn new(sender_pubkey: PublicKey, nonce: u64, fee: u64, payload: Vec<u8>) -> Self {
        Transaction {
            sender_pubkey,
            nonce,
            fee,
            payload,
            signature: Sig::default(),
        }
    }

    fn signing_data(&self) -> TransactionSigningData<'_> {
        TransactionSigningData {
            sender_pubkey: &self.sender_pubkey,
            nonce: self.nonce,
            fee: self.fee,
            payload: &self.payload,
        }
    }

    /// Get bytes for signing
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serialize::to_bytes(&self.signing_data())
    }

    /// Sign the transaction
    pub fn sign(&mut self, secret_key: &SecretKey) -> Result<(), CoreError> {
        let bytes = self.signing_bytes()?;
        self.signature = sign(secret_key, &bytes);
        Ok(())
    }

    /// Create a signed transaction
    pub fn new_signed(
        sender_pubkey: PublicKey,
        nonce: u64,
        fee: u64,
        payload: Vec<u8>,
        secret_key: &SecretKey,
    ) -> Result<Self, CoreError> {
        let mut tx = Self::new(sender_pubkey, nonce, fee, payload);
        tx.sign(secret_key)?;
        Ok(tx)
    }

    /// Verify the transaction signature
    pub fn verify_signature(&self) -> Result<(), CoreError> {
        let bytes = self.signing_bytes()?;
        verify(&self.sender_pubkey, &bytes, &self.signature)
    }

    /// Compute the transaction hash (includes signature)
    pub fn hash(&self) -> Result<Hash, CoreError> {
        let bytes = serialize::to_bytes(self)?;
        Ok(hash_blake3(&bytes))
    }

    /// Size of the canonical encoding, used for batch byte limits
    pub fn encoded_size(&self) -> usize {
        serialize::to_bytes(self).map(|b| b.len()).unwrap_or(usize::MAX)
    }
}
