//! Pessimistic version guard
//!
//! Word layout:
//! - bits 56..64: reader count
//! - bits 0..56: writer version (odd = write locked)

use std::sync::atomic::{AtomicU64, Ordering};

use super::VersionGuard;

const READER_SHIFT: u32 = 56;
const READER_ONE: u64 = 1 << READER_SHIFT;
const VERSION_MASK: u64 = READER_ONE - 1;
const MAX_READERS: u64 = 0xFF;

/// Bound on CAS retries inside a single acquisition
const MAX_CAS_ATTEMPTS: usize = 64;

/// Decoded view of a pessimistic lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockState {
    /// Number of readers holding the word
    pub readers: u64,
    /// Writer version
    pub version: u64,
}

impl LockState {
    /// Decode a raw word
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self {
            readers: control >> READER_SHIFT,
            version: control & VERSION_MASK,
        }
    }

    /// Encode to a raw word
    #[inline]
    pub const fn to_control(&self) -> u64 {
        (self.readers << READER_SHIFT) | (self.version & VERSION_MASK)
    }

    /// Whether a writer holds the word
    #[inline]
    pub const fn write_locked(&self) -> bool {
        self.version & 1 == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    None,
    Read,
    Write,
}

/// Blocking-free, reader-counting guard over one version word.
#[derive(Debug)]
#[must_use = "locks are released when the guard drops"]
pub struct PessimisticGuard<'a> {
    word: &'a AtomicU64,
    version: u64,
    held: Held,
}

impl<'a> PessimisticGuard<'a> {
    pub(super) fn new(word: &'a AtomicU64) -> Self {
        Self {
            word,
            version: LockState::from_control(word.load(Ordering::Acquire)).version,
            held: Held::None,
        }
    }

    /// Decoded state of the underlying word
    #[inline]
    pub fn state(&self) -> LockState {
        LockState::from_control(self.word.load(Ordering::Acquire))
    }
}

impl VersionGuard for PessimisticGuard<'_> {
    fn read_lock(&mut self) -> bool {
        debug_assert!(self.held == Held::None, "lock already held");
        let mut current = self.word.load(Ordering::Acquire);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let state = LockState::from_control(current);
            if state.write_locked() || state.readers == MAX_READERS {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                current + READER_ONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.version = state.version;
                    self.held = Held::Read;
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn write_lock(&mut self) -> bool {
        debug_assert!(self.held == Held::None, "lock already held");
        let mut current = self.word.load(Ordering::Acquire);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let state = LockState::from_control(current);
            if state.write_locked() || state.readers != 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.version = state.version + 1;
                    self.held = Held::Write;
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn upgrade_to_write_lock(&mut self) -> bool {
        if self.held != Held::Read {
            return false;
        }
        let mut current = self.word.load(Ordering::Acquire);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let state = LockState::from_control(current);
            // Only the sole reader may upgrade
            if state.write_locked() || state.readers != 1 {
                return false;
            }
            let desired = LockState {
                readers: 0,
                version: state.version + 1,
            };
            match self.word.compare_exchange_weak(
                current,
                desired.to_control(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.version = desired.version;
                    self.held = Held::Write;
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn validate(&self) -> bool {
        true
    }

    fn unlock(&mut self) {
        match self.held {
            Held::Read => {
                let prev = self.word.fetch_sub(READER_ONE, Ordering::Release);
                debug_assert!(
                    LockState::from_control(prev).readers > 0,
                    "read unlock with zero readers"
                );
            }
            Held::Write => {
                let prev = self.word.fetch_add(1, Ordering::Release);
                debug_assert!(
                    LockState::from_control(prev).write_locked(),
                    "write unlock of an unlocked word"
                );
                self.version += 1;
            }
            Held::None => {}
        }
        self.held = Held::None;
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn more_than_one_writer_since(&self, since: u64) -> bool {
        let current = self.state().version;
        current.wrapping_sub(since & VERSION_MASK) & VERSION_MASK > 2
    }
}

impl Drop for PessimisticGuard<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}
