//! Tessera Core - Core types, cryptography, and serialization
//!
//! Blocks, votes, certificates and the validator set shared by every
//! consensus engine, plus the ed25519/blake3 primitives they are signed
//! and identified with.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{hash_blake3, merkle_root, sign, verify, Hash, KeyPair, PublicKey, SecretKey, Sig};
pub use error::CoreError;
pub use types::*;
