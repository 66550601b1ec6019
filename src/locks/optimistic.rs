//! Optimistic version guard
//!
//! Word layout: a plain version counter. Even = unlocked, odd = write locked.

use std::sync::atomic::{AtomicU64, Ordering};

use super::VersionGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    None,
    Read,
    Write,
}

/// Non-blocking guard over one version word.
///
/// Owns nothing but a reference to the shared word. Only a writer has a
/// release side effect (the paired increment back to an even version).
#[derive(Debug)]
#[must_use = "a write lock is released when the guard drops"]
pub struct OptimisticGuard<'a> {
    word: &'a AtomicU64,
    version: u64,
    held: Held,
}

impl<'a> OptimisticGuard<'a> {
    pub(super) fn new(word: &'a AtomicU64) -> Self {
        Self {
            word,
            version: word.load(Ordering::Acquire),
            held: Held::None,
        }
    }

    #[inline]
    const fn is_locked(version: u64) -> bool {
        version & 1 == 1
    }

    /// Whether this guard currently holds the write lock
    #[inline]
    pub fn holds_write(&self) -> bool {
        self.held == Held::Write
    }
}

impl VersionGuard for OptimisticGuard<'_> {
    fn read_lock(&mut self) -> bool {
        debug_assert!(self.held != Held::Write, "read_lock while write locked");
        let v = self.word.load(Ordering::Acquire);
        if Self::is_locked(v) {
            return false;
        }
        self.version = v;
        self.held = Held::Read;
        true
    }

    fn write_lock(&mut self) -> bool {
        debug_assert!(self.held != Held::Write, "write lock already held");
        let v = self.version;
        if Self::is_locked(v) {
            return false;
        }
        match self
            .word
            .compare_exchange(v, v + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.version = v + 1;
                self.held = Held::Write;
                true
            }
            Err(_) => false,
        }
    }

    fn upgrade_to_write_lock(&mut self) -> bool {
        if self.held != Held::Read {
            return false;
        }
        let v = self.version;
        match self
            .word
            .compare_exchange(v, v + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.version = v + 1;
                self.held = Held::Write;
                true
            }
            Err(_) => false,
        }
    }

    fn validate(&self) -> bool {
        match self.held {
            Held::Write => true,
            Held::Read | Held::None => {
                !Self::is_locked(self.version) && self.word.load(Ordering::Acquire) == self.version
            }
        }
    }

    fn unlock(&mut self) {
        if self.held == Held::Write {
            let prev = self.word.fetch_add(1, Ordering::Release);
            debug_assert!(Self::is_locked(prev), "unlock of an unlocked word");
            self.version = prev + 1;
        }
        self.held = Held::None;
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn more_than_one_writer_since(&self, since: u64) -> bool {
        // Each writer moves the word by two: lock and unlock.
        self.word.load(Ordering::Acquire).wrapping_sub(since) > 2
    }
}

impl Drop for OptimisticGuard<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_lock_on_even_version() {
        let word = AtomicU64::new(4);
        let mut guard = OptimisticGuard::new(&word);
        assert!(guard.read_lock());
        assert_eq!(guard.version(), 4);
        assert!(guard.validate());
    }

    #[test]
    fn test_read_lock_fails_on_odd_version() {
        let word = AtomicU64::new(5);
        let mut guard = OptimisticGuard::new(&word);
        assert!(!guard.read_lock());
    }

    #[test]
    fn test_write_lock_and_release_restores_even() {
        let word = AtomicU64::new(0);
        {
            let mut guard = OptimisticGuard::new(&word);
            assert!(guard.write_lock());
            assert_eq!(word.load(Ordering::Relaxed), 1);
            assert!(guard.holds_write());
        }
        assert_eq!(word.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_writer_invalidates_reader() {
        let word = AtomicU64::new(0);
        let mut reader = OptimisticGuard::new(&word);
        assert!(reader.read_lock());

        {
            let mut writer = OptimisticGuard::new(&word);
            assert!(writer.write_lock());
            assert!(!reader.validate());
        }
        assert!(!reader.validate());
    }

    #[test]
    fn test_write_lock_loses_race_against_stale_version() {
        let word = AtomicU64::new(0);
        let mut stale = OptimisticGuard::new(&word);

        let mut winner = OptimisticGuard::new(&word);
        assert!(winner.write_lock());
        winner.unlock();

        assert!(!stale.write_lock());
        assert_eq!(word.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_upgrade_to_write_lock() {
        let word = AtomicU64::new(2);
        let mut guard = OptimisticGuard::new(&word);
        assert!(guard.read_lock());
        assert!(guard.upgrade_to_write_lock());
        assert_eq!(word.load(Ordering::Relaxed), 3);
        drop(guard);
        assert_eq!(word.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_upgrade_fails_after_intervening_writer() {
        let word = AtomicU64::new(0);
        let mut guard = OptimisticGuard::new(&word);
        assert!(guard.read_lock());

        let mut writer = OptimisticGuard::new(&word);
        assert!(writer.write_lock());
        drop(writer);

        assert!(!guard.upgrade_to_write_lock());
    }

    #[test]
    fn test_upgrade_requires_read_lock() {
        let word = AtomicU64::new(0);
        let mut guard = OptimisticGuard::new(&word);
        assert!(!guard.upgrade_to_write_lock());
    }

    #[test]
    fn test_more_than_one_writer_since() {
        let word = AtomicU64::new(0);
        let observer = OptimisticGuard::new(&word);
        let since = observer.version();

        let mut w1 = OptimisticGuard::new(&word);
        assert!(w1.write_lock());
        drop(w1);
        assert!(!observer.more_than_one_writer_since(since));

        let mut w2 = OptimisticGuard::new(&word);
        assert!(w2.write_lock());
        assert!(observer.more_than_one_writer_since(since));
    }

    #[test]
    fn test_even_iff_no_writer_holds_word() {
        let word = AtomicU64::new(0);
        for _ in 0..16 {
            let mut guard = OptimisticGuard::new(&word);
            assert_eq!(word.load(Ordering::Relaxed) % 2, 0);
            assert!(guard.write_lock());
            assert_eq!(word.load(Ordering::Relaxed) % 2, 1);
            guard.unlock();
            assert_eq!(word.load(Ordering::Relaxed) % 2, 0);
        }
        assert_eq!(word.load(Ordering::Relaxed), 32);
    }
}
