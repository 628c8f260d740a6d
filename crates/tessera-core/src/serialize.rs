use serde::{Deserialize, Serialize};

use crate::crypto::{hash_blake3, Hash};
use crate::error::CoreError;

/// Deterministic bincode encoding; the canonical form for hashing and signing
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    bincode::serialize(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

pub fn from_bytes<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CoreError> {
    bincode::deserialize(bytes).map_err(|e| CoreError::Deserialization(e.to_string()))
}

/// Blake3 digest of the canonical encoding
pub fn digest<T: Serialize>(value: &T) -> Result<Hash, CoreError> {
    Ok(hash_blake3(&to_bytes(value)?))
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, CoreError> {
    serde_json::to_string(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

pub fn from_json<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T, CoreError> {
    serde_json::from_str(json).map_err(|e| CoreError::Deserialization(e.to_string()))
}
