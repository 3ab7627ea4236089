//! Hash functions over encoded keys.
//!
//! The table only ever sees `hash(encoded key)`; its low bits pick the
//! initial slot. A table file must always be reopened with the hash
//! function it was written with.

use std::hash::BuildHasher;

use xxhash_rust::xxh3::xxh3_64;

pub trait HashFunction: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> u64;
}

/// XXH3-64. Stable across processes and platforms; the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHash;

impl HashFunction for XxHash {
    #[inline]
    fn hash(&self, bytes: &[u8]) -> u64 {
        xxh3_64(bytes)
    }
}

/// aHash with fixed seeds. Fast, but its output depends on the CPU
/// features it was compiled for, so prefer [`XxHash`] for files that move
/// between machines.
#[derive(Clone)]
pub struct AHash {
    state: ahash::RandomState,
}

impl AHash {
    pub fn with_seeds(k0: u64, k1: u64, k2: u64, k3: u64) -> Self {
        AHash {
            state: ahash::RandomState::with_seeds(k0, k1, k2, k3),
        }
    }
}

impl Default for AHash {
    fn default() -> Self {
        AHash::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        )
    }
}

impl HashFunction for AHash {
    #[inline]
    fn hash(&self, bytes: &[u8]) -> u64 {
        BuildHasher::hash_one(&self.state, bytes)
    }
}

/// The first eight bytes of the key, little-endian. Places integer keys at
/// predictable slots; only useful when keys are already well spread.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityHash;

impl HashFunction for IdentityHash {
    #[inline]
    fn hash(&self, bytes: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        let n = bytes.len().min(8);
        raw[..n].copy_from_slice(&bytes[..n]);
        u64::from_le_bytes(raw)
    }
}
