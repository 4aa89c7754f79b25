//! # Content Hashing
//!
//! BLAKE3-256 identity for every structure that is addressed by content:
//! tagged nodes (types, judgments, expressions, control-flow graphs),
//! memoized values, serialized objects and page identifiers.
//!
//! Two values with the same hash are treated as the same value everywhere in
//! the runtime. At 256 bits the birthday bound sits near 2^128 distinct
//! objects, so no fallback deep comparison is performed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Version byte mixed into every hash.
/// Bump when a canonical encoding changes.
pub const HASH_FORMAT_VERSION: u8 = 1;

/// A 256-bit BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Length of the digest in bytes.
    pub const LEN: usize = 32;

    /// The all-zero hash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a byte slice.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash a string tag, used for well-known constants.
    pub fn of_str(name: &str) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update_str(name);
        hasher.finalize()
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The successor of this hash, treating it as a big-endian integer.
    ///
    /// Wraps to zero after the maximum value. Used to walk a hash-seeded
    /// cursor through an ordered keyspace.
    pub fn successor(&self) -> Self {
        let mut out = self.0;
        for byte in out.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
        Self(out)
    }

    /// Lowercase hex rendering of all 32 bytes.
    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        }
        out
    }

    /// Parse a 64 character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            out[i] = (hi * 16 + lo) as u8;
        }
        Some(Self(out))
    }
}

impl Default for ContentHash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", &self.to_hex()[..12])
    }
}

/// Incremental builder for [`ContentHash`] values.
///
/// Every update is length- or width-prefixed by construction, so adjacent
/// fields cannot alias each other.
pub struct ContentHasher {
    hasher: blake3::Hasher,
}

impl ContentHasher {
    /// A hasher whose first input is [`HASH_FORMAT_VERSION`].
    pub fn new() -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[HASH_FORMAT_VERSION]);
        Self { hasher }
    }

    /// Mix in bytes with no length prefix.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Mix in a u64, little-endian.
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(&value.to_le_bytes());
    }


    /// Mix in a string, length first.
    pub fn update_str(&mut self, s: &str) {
        self.update_bytes(s.as_bytes());
    }

    /// Mix in a byte slice, length first.
    pub fn update_bytes(&mut self, data: &[u8]) {
        self.update_u64(data.len() as u64);
        self.hasher.update(data);
    }

    /// Mix in a child's digest.
    pub fn update_hash(&mut self, hash: &ContentHash) {
        self.hasher.update(hash.as_bytes());
    }

    /// Consume the hasher.
    pub fn finalize(self) -> ContentHash {
        ContentHash(*self.hasher.finalize().as_bytes())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(ContentHash::of(b"page"), ContentHash::of(b"page"));
        assert_ne!(ContentHash::of(b"page"), ContentHash::of(b"pagelet"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let h = ContentHash::of_str("Int64");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex), Some(h));
        assert_eq!(ContentHash::from_hex("zz"), None);
    }

    #[test]
    fn test_successor_carries() {
        let mut bytes = [0u8; 32];
        bytes[31] = 0xff;
        let next = ContentHash::from_bytes(bytes).successor();
        assert_eq!(next.as_bytes()[31], 0);
        assert_eq!(next.as_bytes()[30], 1);
        assert!(next > ContentHash::from_bytes(bytes));

        let max = ContentHash::from_bytes([0xff; 32]);
        assert_eq!(max.successor(), ContentHash::ZERO);
    }

    #[test]
    fn test_length_prefix_prevents_aliasing() {
        let mut a = ContentHasher::new();
        a.update_str("ab");
        a.update_str("c");
        let mut b = ContentHasher::new();
        b.update_str("a");
        b.update_str("bc");
        assert_ne!(a.finalize(), b.finalize());
    }
}
