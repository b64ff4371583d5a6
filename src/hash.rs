//! The 32-byte content hash used throughout the agent.

use std::fmt;

/// Number of bytes in a binary SHA-256 digest.
pub const HASH_LEN: usize = 32;

/// A binary SHA-256 digest of one block of a regular file's contents.
///
/// Ordering is the natural lexicographic (unsigned byte-wise) comparison of
/// the underlying array, which is exactly the ordering the Hash Index relies
/// on for deterministic persistence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Wrap a 32-byte digest.
    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the digest as a byte slice.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Parse a hash from an exactly-`HASH_LEN`-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordering_is_unsigned_lexicographic() {
        let low = Hash::new([0x00; HASH_LEN]);
        let mut high_bytes = [0x00; HASH_LEN];
        high_bytes[0] = 0x80;
        let high = Hash::new(high_bytes);
        assert!(low < high, "0x80 must sort after 0x00 under unsigned comparison");
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Hash::from_slice(&[0u8; 31]).is_none());
        assert!(Hash::from_slice(&[0u8; 33]).is_none());
        assert!(Hash::from_slice(&[0u8; HASH_LEN]).is_some());
    }
}
