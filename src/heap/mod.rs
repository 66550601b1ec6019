//! Heap store
//!
//! A directory of fixed-size pages holding variable-length tuples. The hash
//! table keeps its overflow pages here.
//!
//! Page selection on insert goes through three levels so concurrent inserters
//! rarely meet on the same page or the same lock:
//!
//! 1. a per-thread candidate page,
//! 2. a shared list of pages with free space, sampled at random,
//! 3. a scan of the page directory that rebuilds that list.
//!
//! When all three come up empty the store grows by
//! [`HeapConfig::growth_pages`] pages, or fails with
//! [`Status::NotEnoughSpace`](crate::Status::NotEnoughSpace) if it is not
//! growable.

mod page;
mod stats;
mod store;


use std::fmt;

pub use page::{max_tuple_size, HeapPage, SlotState, SLOT_SIZE};
pub use stats::{HeapStats, HeapStatsSnapshot};
pub use store::HeapStore;

/// Handle of a tuple: heap page number and slot
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleId(u64);

impl TupleId {
    const SLOT_BITS: u32 = 16;
    const SLOT_MASK: u64 = (1 << Self::SLOT_BITS) - 1;

    /// Largest representable page number
    pub const MAX_PAGE: u64 = (1 << (64 - Self::SLOT_BITS)) - 1;

    /// Invalid tuple id
    pub const INVALID: TupleId = TupleId(u64::MAX);

    /// Create a tuple id
    #[inline]
    pub const fn new(page: u64, slot: u16) -> Self {
        Self(((page & Self::MAX_PAGE) << Self::SLOT_BITS) | slot as u64)
    }

    /// Rebuild a tuple id from its raw encoding
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit encoding
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Heap page number
    #[inline]
    pub const fn page(&self) -> u64 {
        self.0 >> Self::SLOT_BITS
    }

    /// Slot within the page
    #[inline]
    pub const fn slot(&self) -> u16 {
        (self.0 & Self::SLOT_MASK) as u16
    }

    /// Check if this is the invalid id
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for TupleId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            return write!(f, "TupleId(INVALID)");
        }
        write!(f, "TupleId({}:{})", self.page(), self.slot())
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page(), self.slot())
    }
}

/// Heap store configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Pages allocated when the store is created
    pub initial_pages: usize,
    /// Pages added per growth step
    pub growth_pages: usize,
    /// Whether the store may grow at all
    pub growable: bool,
    /// Capacity budget; reaching it makes the store non-growable
    pub max_pages: Option<usize>,
    /// Free fraction at which a page is re-listed after a delete
    pub free_space_threshold: f64,
}

impl HeapConfig {
    /// Default number of pages per growth step
    pub const DEFAULT_GROWTH_PAGES: usize = 8;
    /// Default re-admission threshold
    pub const DEFAULT_FREE_SPACE_THRESHOLD: f64 = 0.25;
    /// Width of the re-admission band above the threshold
    pub const FREE_SPACE_BAND: f64 = 0.2;
    /// Highest accepted threshold (the band must fit below 1.0)
    pub const MAX_FREE_SPACE_THRESHOLD: f64 = 1.0 - Self::FREE_SPACE_BAND;

    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial page count
    pub fn with_initial_pages(mut self, pages: usize) -> Self {
        self.initial_pages = pages;
        self
    }

    /// Set the growth step (at least one page)
    pub fn with_growth_pages(mut self, pages: usize) -> Self {
        self.growth_pages = pages.max(1);
        self
    }

    /// Enable or disable growth
    pub fn with_growable(mut self, growable: bool) -> Self {
        self.growable = growable;
        self
    }

    /// Set the capacity budget
    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Set the re-admission threshold (clamped to `[0, MAX_FREE_SPACE_THRESHOLD]`)
    pub fn with_free_space_threshold(mut self, threshold: f64) -> Self {
        self.free_space_threshold = if threshold.is_nan() {
            Self::DEFAULT_FREE_SPACE_THRESHOLD
        } else {
            threshold.clamp(0.0, Self::MAX_FREE_SPACE_THRESHOLD)
        };
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_pages: 0,
            growth_pages: Self::DEFAULT_GROWTH_PAGES,
            growable: true,
            max_pages: None,
            free_space_threshold: Self::DEFAULT_FREE_SPACE_THRESHOLD,
        }
    }
}
