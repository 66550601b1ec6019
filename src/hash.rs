//! Stable hashing for key bytes.
//!
//! The hash must be deterministic across runs since bucket placement and lock
//! word selection are derived from it. We do not use `DefaultHasher`.

#[cfg(not(any(feature = "hash-xxh3", feature = "hash-xxh64")))]
compile_error!("Enable a hash feature: `hash-xxh3` (default) or `hash-xxh64`.");

/// Hash key bytes into a 64-bit value (deterministic).
#[inline]
pub fn hash64(bytes: &[u8]) -> u64 {
    #[cfg(feature = "hash-xxh3")]
    {
        xxhash_rust::xxh3::xxh3_64(bytes)
    }

    #[cfg(all(not(feature = "hash-xxh3"), feature = "hash-xxh64"))]
    {
        xxhash_rust::xxh64::xxh64(bytes, 0)
    }
}

/// Hash of a key, with the derived values the table needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyHash {
    hash: u64,
}

impl KeyHash {
    /// Number of bits used for the fingerprint
    pub const FINGERPRINT_BITS: u32 = 16;

    /// Create a key hash from a raw value
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self { hash }
    }

    /// Hash key bytes
    #[inline]
    pub fn of(key: &[u8]) -> Self {
        Self::new(hash64(key))
    }

    /// Get the full hash value
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Short per-slot fingerprint taken from the high bits.
    ///
    /// Bucket routing consumes the low bits, so the two stay independent.
    #[inline]
    pub const fn fingerprint(&self) -> u16 {
        (self.hash >> (64 - Self::FINGERPRINT_BITS)) as u16
    }

    /// `hash(key, i)`: bucket of this key in a table of `base * 2^power` buckets.
    ///
    /// `bucket(base, i + 1)` is always either `bucket(base, i)` or
    /// `bucket(base, i) + base * 2^i`.
    #[inline]
    pub const fn bucket(&self, base: u64, power: u32) -> u64 {
        self.hash % (base << power)
    }

    /// Index of the lock word guarding this key in a table of `words` words
    #[inline]
    pub const fn lock_index(&self, words: usize) -> usize {
        (self.hash % words as u64) as usize
    }
}

impl From<u64> for KeyHash {
    #[inline]
    fn from(hash: u64) -> Self {
        Self::new(hash)
    }
}
