//! Chunk fingerprinting: CRC-32 weak fingerprints and BLAKE3 strong fingerprints.
//!
//! The weak fingerprint is only a candidate filter; equality of strong
//! fingerprints is treated as equality of content.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-bit weak fingerprint of a chunk (CRC-32). Collisions are expected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeakFp(pub u32);

impl WeakFp {
    /// Bucket index in a table of `2^bits` buckets: the low `bits` bits.
    pub fn bucket(&self, bits: u32) -> usize {
        (self.0 as u64 & bucket_mask(bits)) as usize
    }
}

impl fmt::Display for WeakFp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// 256-bit strong fingerprint of a chunk (BLAKE3), stored as four little-endian words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongFp(pub [u64; 4]);

impl StrongFp {
    /// Bucket index in a table of `2^bits` buckets: the low `bits` bits of the first word.
    pub fn bucket(&self, bits: u32) -> usize {
        (self.0[0] & bucket_mask(bits)) as usize
    }

    /// Return the fingerprint as 32 little-endian bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.0.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Rebuild a fingerprint from 32 little-endian bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
        StrongFp(words)
    }

    /// Return the fingerprint as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.to_bytes().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for StrongFp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn bucket_mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// Compute the CRC-32 weak fingerprint of a chunk.
pub fn weak_fingerprint(data: &[u8]) -> WeakFp {
    WeakFp(crc32fast::hash(data))
}

/// Compute the BLAKE3 strong fingerprint of a chunk.
pub fn strong_fingerprint(data: &[u8]) -> StrongFp {
    StrongFp::from_bytes(blake3::hash(data).as_bytes())
}
