//! Heap store statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a heap store
#[derive(Debug, Default)]
pub struct HeapStats {
    inserts: AtomicU64,
    removes: AtomicU64,
    slot_reuses: AtomicU64,
    grow_events: AtomicU64,
    pages: AtomicU64,
    tuples: AtomicU64,
}

impl HeapStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful insert
    pub fn record_insert(&self, reused_slot: bool) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.tuples.fetch_add(1, Ordering::Relaxed);
        if reused_slot {
            self.slot_reuses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a removed tuple
    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.tuples.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record pages added at creation
    pub fn record_pages(&self, pages: u64) {
        self.pages.fetch_add(pages, Ordering::Relaxed);
    }

    /// Record a growth step that added `pages` pages
    pub fn record_growth(&self, pages: u64) {
        self.grow_events.fetch_add(1, Ordering::Relaxed);
        self.pages.fetch_add(pages, Ordering::Relaxed);
    }

    /// Number of live tuples
    pub fn tuples(&self) -> u64 {
        self.tuples.load(Ordering::Relaxed)
    }

    /// Take a consistent-enough copy of all counters
    pub fn snapshot(&self) -> HeapStatsSnapshot {
        HeapStatsSnapshot {
            pages: self.pages.load(Ordering::Relaxed),
            tuples: self.tuples.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            slot_reuses: self.slot_reuses.load(Ordering::Relaxed),
            grow_events: self.grow_events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`HeapStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatsSnapshot {
    /// Pages owned by the store
    pub pages: u64,
    /// Live tuples
    pub tuples: u64,
    /// Successful inserts
    pub inserts: u64,
    /// Successful removes
    pub removes: u64,
    /// Inserts that landed in a removed slot of the same size
    pub slot_reuses: u64,
    /// Growth steps
    pub grow_events: u64,
}
