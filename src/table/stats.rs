//! Hash table statistics
//!
//! A read-only side channel; nothing in the table reads these counters back.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::heap::HeapStatsSnapshot;

/// Counters maintained by a hash table
#[derive(Debug, Default)]
pub struct TableStats {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    upserts: AtomicU64,
    removes: AtomicU64,
    splits: AtomicU64,
    splits_skipped: AtomicU64,
    rounds: AtomicU64,
    overflow_allocated: AtomicU64,
    overflow_freed: AtomicU64,
    restarts: AtomicU64,
}

impl TableStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lookup and whether it found the key
    pub fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a successful insert
    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful in-place update
    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful upsert
    pub fn record_upsert(&self) {
        self.upserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful remove
    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed bucket split
    pub fn record_split(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a split abandoned for lack of overflow space
    pub fn record_split_skipped(&self) {
        self.splits_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed doubling round
    pub fn record_round(&self) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` overflow pages allocated
    pub fn record_overflow_allocated(&self, count: u64) {
        self.overflow_allocated.fetch_add(count, Ordering::Relaxed);
    }

    /// Record `count` overflow pages released
    pub fn record_overflow_freed(&self, count: u64) {
        self.overflow_freed.fetch_add(count, Ordering::Relaxed);
    }

    /// Record an attempt restarted after a conflict
    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self, overflow: HeapStatsSnapshot) -> TableStatsSnapshot {
        TableStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            upserts: self.upserts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            splits_skipped: self.splits_skipped.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            overflow_allocated: self.overflow_allocated.load(Ordering::Relaxed),
            overflow_freed: self.overflow_freed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            overflow,
        }
    }
}

/// Point-in-time copy of [`TableStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStatsSnapshot {
    /// Lookups
    pub lookups: u64,
    /// Lookups that found the key
    pub hits: u64,
    /// Lookups that did not
    pub misses: u64,
    /// Inserts
    pub inserts: u64,
    /// In-place updates
    pub updates: u64,
    /// Upserts
    pub upserts: u64,
    /// Removes
    pub removes: u64,
    /// Completed bucket splits
    pub splits: u64,
    /// Splits abandoned for lack of overflow space
    pub splits_skipped: u64,
    /// Completed doubling rounds
    pub rounds: u64,
    /// Overflow pages allocated
    pub overflow_allocated: u64,
    /// Overflow pages released
    pub overflow_freed: u64,
    /// Attempts restarted after a conflict
    pub restarts: u64,
    /// Overflow heap store counters
    pub overflow: HeapStatsSnapshot,
}

impl TableStatsSnapshot {
    /// Fraction of lookups that found their key
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / self.lookups as f64
    }
}
