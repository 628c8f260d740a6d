use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::hash::hash_blake3;
use crate::error::CoreError;

/// Ed25519 public key. Doubles as the validator identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.try_into().ok()?;
        Some(PublicKey(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(CoreError::InvalidPublicKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub(crate) fn to_verifying_key(&self) -> Result<VerifyingKey, CoreError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Ed25519 secret key. Deliberately not serializable.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn generate() -> Self {
        SecretKey(SigningKey::generate(&mut OsRng))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SecretKey(SigningKey::from_bytes(bytes))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::InvalidSecretKey)?;
        Ok(Self::from_bytes(&seed))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A validator's signing identity
#[derive(Clone)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        KeyPair { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_secret(SecretKey::from_bytes(bytes))
    }

    /// Deterministic keypair derived from a small seed. Used by local
    /// clusters and tests where every node must agree on the key set.
    pub fn from_seed(seed: u64) -> Self {
        let digest = hash_blake3(&seed.to_le_bytes());
        Self::from_secret_bytes(digest.as_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_keypairs_are_stable() {
        assert_eq!(KeyPair::from_seed(7).public, KeyPair::from_seed(7).public);
        assert_ne!(KeyPair::from_seed(7).public, KeyPair::from_seed(8).public);
    }

    #[test]
    fn test_secret_key_hex_roundtrip_preserves_identity() {
        let kp = KeyPair::generate();
        let restored = SecretKey::from_hex(&kp.secret.to_hex()).unwrap();
        assert_eq!(restored.public_key(), kp.public);
    }

    #[test]
    fn test_secret_key_hex_rejects_wrong_length() {
        assert!(matches!(
            SecretKey::from_hex("00ff"),
            Err(CoreError::InvalidSecretKey)
        ));
    }

    #[test]
    fn test_debug_output_redacts_secret() {
        let kp = KeyPair::from_seed(1);
        let rendered = format!("{:?}", kp);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&kp.secret.to_hex()));
    }
}
