//! Build Cache Keys
//!
//! Defines [`HashKey`], the fixed-width content hash that identifies an entry
//! in the local build cache. Collaborators exchange the raw bytes; the cache
//! itself uses the canonical uppercase hex form for file names and logging.

mod error;

pub use error::KeyError;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Number of bytes in a SHA-256 key.
pub const SHA256_LEN: usize = 32;

/// Immutable content hash used as a cache key.
///
/// Two keys are equal iff their bytes are equal. The in-memory hash is
/// computed once at construction.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HashKey {
    bytes: Box<[u8]>,
    hash: u64,
}

impl HashKey {
    /// Create a key from raw hash bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self::new(bytes.into()))
    }

    /// Parse a hex string (either case).
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        if s.len() % 2 != 0 {
            return Err(KeyError::OddLength { len: s.len() });
        }
        match hex::decode(s) {
            Ok(bytes) => Ok(Self::new(bytes.into_boxed_slice())),
            Err(hex::FromHexError::InvalidHexCharacter { c, index }) => {
                Err(KeyError::InvalidCharacter { c, index })
            }
            Err(_) => Err(KeyError::OddLength { len: s.len() }),
        }
    }

    /// SHA-256 of `data` as a key.
    pub fn sha256(data: &[u8]) -> Self {
        Self::new(Sha256::digest(data).as_slice().into())
    }

    fn new(bytes: Box<[u8]>) -> Self {
        // Content hashes are uniformly distributed, so the leading bytes are
        // as good a map hash as any.
        let mut prefix = [0u8; 8];
        let n = bytes.len().min(8);
        prefix[..n].copy_from_slice(&bytes[..n]);
        let hash = u64::from_be_bytes(prefix) ^ bytes.len() as u64;
        Self { bytes, hash }
    }

    /// Canonical uppercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.bytes)
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes in the key.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; keys hold at least one byte.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashKey({})", self.to_hex())
    }
}

impl FromStr for HashKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for HashKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
