//! Versioned lock table
//!
//! A fixed array of [`LOCK_WORDS`] atomic version words, sharded by key hash.
//! Unrelated keys may share a word; that costs false conflicts, never
//! correctness, and there is no per-key allocation.
//!
//! Two guard flavours operate on the same words:
//!
//! - [`OptimisticGuard`]: even version = unlocked, odd = write locked. Readers
//!   never block and validate after use; writers CAS `v -> v + 1` and release
//!   with one more increment.
//! - [`PessimisticGuard`]: the top byte of the word counts readers, the rest is
//!   the writer version. Holding the guard serializes against writers, so
//!   validation is trivially true.
//!
//! A table uses one flavour only. [`RecordGuard`] names the flavour selected
//! at compile time (`pessimistic-locks` feature).

mod optimistic;
mod pessimistic;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::CACHE_LINE_BYTES;
use crate::hash::KeyHash;
use crate::utility::Backoff;

pub use optimistic::OptimisticGuard;
pub use pessimistic::PessimisticGuard;

/// Number of version words in a lock table (prime, to spread hashes)
pub const LOCK_WORDS: usize = 4093;

/// Common contract of both guard flavours.
///
/// All failures are reported as `false`; callers retry.
pub trait VersionGuard {
    /// Take a read lock. Fails if a writer holds the word.
    fn read_lock(&mut self) -> bool;

    /// Take the write lock. Fails if the CAS loses a race or a writer holds the word.
    fn write_lock(&mut self) -> bool;

    /// Convert a held read lock into the write lock.
    fn upgrade_to_write_lock(&mut self) -> bool;

    /// Check that nothing was written since the guard observed the word.
    fn validate(&self) -> bool;

    /// Release whatever the guard holds. Dropping the guard does the same.
    fn unlock(&mut self);

    /// Writer version observed by the guard
    fn version(&self) -> u64;

    /// Whether more than one writer committed since version `since` was observed.
    fn more_than_one_writer_since(&self, since: u64) -> bool;
}

/// Guard flavour used for record locks.
#[cfg(not(feature = "pessimistic-locks"))]
pub type RecordGuard<'a> = OptimisticGuard<'a>;

/// Guard flavour used for record locks.
#[cfg(feature = "pessimistic-locks")]
pub type RecordGuard<'a> = PessimisticGuard<'a>;

/// One version word, padded to a cache line
#[repr(align(64))]
#[derive(Debug, Default)]
pub(crate) struct LockWord {
    pub(crate) word: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<LockWord>() == CACHE_LINE_BYTES);

/// The hash-sharded array of version words
pub struct LockTable {
    words: Box<[LockWord]>,
}

impl LockTable {
    /// Create a lock table with [`LOCK_WORDS`] words, all unlocked
    pub fn new() -> Self {
        let words = (0..LOCK_WORDS)
            .map(|_| LockWord::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { words }
    }

    /// Number of words in the table
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Always false; the table has a fixed, non-zero size
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline]
    fn word(&self, hash: KeyHash) -> &AtomicU64 {
        &self.words[hash.lock_index(self.words.len())].word
    }

    /// Current raw value of the word guarding `hash`
    #[inline]
    pub fn load(&self, hash: KeyHash) -> u64 {
        self.word(hash).load(Ordering::Acquire)
    }

    /// Acquire an optimistic guard. Never fails and never blocks.
    #[inline]
    pub fn acquire_optimistic(&self, hash: KeyHash) -> OptimisticGuard<'_> {
        OptimisticGuard::new(self.word(hash))
    }

    /// Acquire a pessimistic guard (no lock is taken until requested).
    #[inline]
    pub fn acquire_pessimistic(&self, hash: KeyHash) -> PessimisticGuard<'_> {
        PessimisticGuard::new(self.word(hash))
    }

    /// Acquire a guard of the compile-time selected flavour.
    #[inline]
    pub fn acquire(&self, hash: KeyHash) -> RecordGuard<'_> {
        #[cfg(not(feature = "pessimistic-locks"))]
        {
            self.acquire_optimistic(hash)
        }
        #[cfg(feature = "pessimistic-locks")]
        {
            self.acquire_pessimistic(hash)
        }
    }

    /// Spin until the write lock for `hash` is held.
    pub fn lock_exclusive(&self, hash: KeyHash) -> RecordGuard<'_> {
        let mut backoff = Backoff::new();
        loop {
            let mut guard = self.acquire(hash);
            if guard.write_lock() {
                return guard;
            }
            backoff.snooze();
        }
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("words", &self.words.len())
            .finish()
    }
}
