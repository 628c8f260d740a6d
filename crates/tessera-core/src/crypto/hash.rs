use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte Blake3 digest identifying blocks, transactions and batches
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash; used as the parent of genesis and as the nil vote target
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn new(data: [u8; 32]) -> Self {
        Hash(data)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.try_into().ok()?;
        Some(Hash(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute Blake3 hash of data
pub fn hash_blake3(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

/// Hash two digests together (left || right)
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&left.0);
    hasher.update(&right.0);
    Hash(*hasher.finalize().as_bytes())
}

/// Merkle root over a list of leaf hashes.
///
/// An empty list yields `Hash::ZERO`; an odd node at any level is paired
/// with itself.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    match hashes {
        [] => Hash::ZERO,
        [single] => *single,
        _ => {
            let mut level: Vec<Hash> = hashes.to_vec();
            while level.len() > 1 {
                level = level
                    .chunks(2)
                    .map(|pair| match pair {
                        [l, r] => hash_pair(l, r),
                        [l] => hash_pair(l, l),
                        _ => unreachable!("chunks(2) yields one or two items"),
                    })
                    .collect();
            }
            level[0]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_blake3(b"block"), hash_blake3(b"block"));
        assert_ne!(hash_blake3(b"block"), hash_blake3(b"other"));
    }

    #[test]
    fn test_merkle_root_edges() {
        assert_eq!(merkle_root(&[]), Hash::ZERO);

        let leaf = hash_blake3(b"only");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_merkle_root_odd_leaf_is_duplicated() {
        let a = hash_blake3(b"a");
        let b = hash_blake3(b"b");
        let c = hash_blake3(b"c");

        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_merkle_root_is_order_sensitive() {
        let a = hash_blake3(b"a");
        let b = hash_blake3(b"b");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn test_hex_parsing_rejects_short_input() {
        assert!(Hash::from_hex("abcd").is_err());
        let hash = hash_blake3(b"x");
        assert_eq!(Hash::from_hex(&hash.to_hex()).unwrap(), hash);
    }
}
