//! Versioned key hash functions.
//!
//! The cluster announces which version every client must use, so the
//! mapping from version number to algorithm is fixed forever once published:
//!
//! | version | algorithm                               |
//! |---------|-----------------------------------------|
//! | 1       | SipHash-1-3, zero key, low 32 bits      |
//! | 2       | XXH3-64, folded to 32 bits (hi ^ lo)    |

use std::hash::Hasher;

use siphasher::sip::SipHasher13;
use xxhash_rust::xxh3::xxh3_64;

use ckv_common::{CacheError, CacheResult};

/// Hash function selected by a topology's `hash_function_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashFunction {
    Sip13,
    Xxh3,
}

impl HashFunction {
    /// Version announced by clusters that do not say otherwise.
    pub const DEFAULT_VERSION: u8 = 2;

    /// Maps a wire version to its algorithm.
    ///
    /// # Errors
    /// `CacheError::InvalidTopology` for unknown versions.
    pub fn from_version(version: u8) -> CacheResult<Self> {
        match version {
            1 => Ok(HashFunction::Sip13),
            2 => Ok(HashFunction::Xxh3),
            other => Err(CacheError::InvalidTopology(format!(
                "unsupported hash function version {}",
                other
            ))),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            HashFunction::Sip13 => 1,
            HashFunction::Xxh3 => 2,
        }
    }

    /// Hashes raw key bytes to a 32-bit ring position (before `mod hash_space`).
    pub fn hash(&self, key: &[u8]) -> u32 {
        match self {
            HashFunction::Sip13 => {
                let mut hasher = SipHasher13::new();
                hasher.write(key);
                hasher.finish() as u32
            }
            HashFunction::Xxh3 => {
                let h = xxh3_64(key);
                ((h >> 32) ^ h) as u32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_roundtrip() {
        for version in [1u8, 2] {
            assert_eq!(HashFunction::from_version(version).unwrap().version(), version);
        }
        assert!(matches!(HashFunction::from_version(9), Err(CacheError::InvalidTopology(_))));
    }

    #[test]
    fn versions_disagree_on_positions() {
        let sip = HashFunction::Sip13;
        let xxh = HashFunction::Xxh3;
        assert_eq!(sip.hash(b"session:42"), sip.hash(b"session:42"));
        assert_ne!(sip.hash(b"session:42"), xxh.hash(b"session:42"));
    }
}
