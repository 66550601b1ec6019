//! Concurrent linear hash table
//!
//! Keys route to buckets through the [`SplitState`]. Each bucket is one page
//! holding a slotted record area plus up to [`OVERFLOW_SLOTS`] overflow pages
//! kept in a [`HeapStore`].
//!
//! Every operation runs as a sequence of attempts:
//!
//! 1. route the key with the current split state,
//! 2. resolve the bucket page through the directory,
//! 3. latch the bucket page,
//! 4. re-read the split state; if it moved, restart,
//! 5. search the primary area, then the overflow pages.
//!
//! The table grows one bucket at a time. When the load factor exceeds
//! [`HashTableConfig::split_load_factor`], the writer that noticed it splits
//! the next bucket of the current round before returning.
//!
//! Writers also hold the key's record lock from the [`LockTable`] for the
//! whole operation; readers validate against it.

mod bucket;
mod directory;
mod ops;
mod split;
mod split_state;
mod stats;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferPool, GuardMode, PageHooks, PageId, ParentRef};
use crate::heap::{HeapConfig, HeapStore};
use crate::locks::LockTable;
use crate::status::Status;
use crate::utility::retry;

use directory::Directory;
use split_state::AtomicSplitState;

pub use bucket::{
    BucketPage, OverflowRefs, SlottedArea, BUCKET_CAPACITY, MAX_RECORD_SIZE, OVERFLOW_PAGE_SIZE,
    OVERFLOW_SLOTS, RECORD_SLOT_SIZE,
};
pub use directory::DIR_NODE_BUCKET_PTR_COUNT;
pub use split_state::SplitState;
pub use stats::{TableStats, TableStatsSnapshot};

/// Hash table configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HashTableConfig {
    /// Number of primary buckets at creation (`N`)
    pub initial_buckets: u64,
    /// Load factor above which a writer splits one bucket
    pub split_load_factor: f64,
    /// Heap store holding overflow pages
    pub overflow: HeapConfig,
}

impl HashTableConfig {
    /// Default `N`
    pub const DEFAULT_INITIAL_BUCKETS: u64 = 64;
    /// Default split threshold
    pub const DEFAULT_SPLIT_LOAD_FACTOR: f64 = 0.75;
    /// Largest accepted `N`; the split state keeps 56 bits of bucket count
    pub const MAX_INITIAL_BUCKETS: u64 = 1 << 40;

    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial bucket count
    pub fn with_initial_buckets(mut self, buckets: u64) -> Self {
        self.initial_buckets = buckets;
        self
    }

    /// Set the split threshold
    pub fn with_split_load_factor(mut self, load_factor: f64) -> Self {
        self.split_load_factor = load_factor;
        self
    }

    /// Set the overflow store configuration
    pub fn with_overflow(mut self, overflow: HeapConfig) -> Self {
        self.overflow = overflow;
        self
    }

    /// Check the values
    pub fn validate(&self) -> Result<(), Status> {
        if self.initial_buckets == 0 || self.initial_buckets > Self::MAX_INITIAL_BUCKETS {
            return Err(Status::InvalidArgument);
        }
        if !self.split_load_factor.is_finite() || self.split_load_factor <= 0.0 {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for HashTableConfig {
    fn default() -> Self {
        Self {
            initial_buckets: Self::DEFAULT_INITIAL_BUCKETS,
            split_load_factor: Self::DEFAULT_SPLIT_LOAD_FACTOR,
            overflow: HeapConfig::default(),
        }
    }
}

/// A concurrent linear hash table over byte keys and byte payloads
pub struct HashTable {
    config: HashTableConfig,
    /// `N`
    base: u64,
    pool: Arc<BufferPool>,
    directory: Directory,
    overflow: HeapStore,
    locks: LockTable,
    split_state: AtomicSplitState,
    /// Serializes claiming the next bucket to split
    split_mutex: Mutex<()>,
    splits_started: AtomicU64,
    splits_finished: AtomicU64,
    records: AtomicU64,
    /// Key, payload and slot bytes of all records
    record_bytes: AtomicU64,
    stats: TableStats,
}

impl HashTable {
    /// Create a table with its own buffer pool
    pub fn new(config: HashTableConfig) -> Result<Self, Status> {
        Self::with_pool(Arc::new(BufferPool::new()), config)
    }

    /// Create a table whose bucket, directory and overflow pages come from `pool`
    pub fn with_pool(pool: Arc<BufferPool>, config: HashTableConfig) -> Result<Self, Status> {
        config.validate()?;
        let overflow = HeapStore::with_pool(Arc::clone(&pool), config.overflow.clone())?;
        let base = config.initial_buckets;

        let table = Self {
            base,
            directory: Directory::new(Arc::clone(&pool)),
            pool,
            overflow,
            locks: LockTable::new(),
            split_state: AtomicSplitState::new(SplitState::initial(base)),
            split_mutex: Mutex::new(()),
            splits_started: AtomicU64::new(0),
            splits_finished: AtomicU64::new(0),
            records: AtomicU64::new(0),
            record_bytes: AtomicU64::new(0),
            stats: TableStats::new(),
            config,
        };

        for bucket in 0..base {
            let frame = table.pool.allocate_page();
            {
                let mut guard = retry(|| frame.acquire(GuardMode::Exclusive))?;
                BucketPage::new(guard.data_mut()).init();
                guard.increment_generation();
            }
            retry(|| table.directory.publish(bucket, frame.page_id()))?;
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                buckets = base,
                directory_pages = table.directory.node_count(),
                split_load_factor = table.config.split_load_factor,
                "hash table created"
            );
        }
        Ok(table)
    }

    /// Configuration the table was created with
    pub fn config(&self) -> &HashTableConfig {
        &self.config
    }

    /// Current `(power, buddy)` pair
    pub fn split_state(&self) -> SplitState {
        self.split_state.load()
    }

    /// Number of addressable buckets
    pub fn num_buckets(&self) -> u64 {
        self.split_state.load().num_buckets()
    }

    /// Number of records
    pub fn len(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Check if the table holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored record bytes over the primary capacity of all buckets
    pub fn current_load_factor(&self) -> f64 {
        let capacity = self.num_buckets() as f64 * BUCKET_CAPACITY as f64;
        self.record_bytes.load(Ordering::Relaxed) as f64 / capacity
    }

    /// Record lock table
    pub fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    /// Heap store holding the overflow pages
    pub fn overflow_store(&self) -> &HeapStore {
        &self.overflow
    }

    /// Buffer pool backing the table
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Counter snapshot
    pub fn stats(&self) -> TableStatsSnapshot {
        self.stats.snapshot(self.overflow.stats())
    }
}

impl PageHooks for HashTable {
    fn iterate_children(&self, page: PageId, visit: &mut dyn FnMut(PageId) -> bool) {
        // Overflow pages are heap tuples, owned by the heap store.
        if let Some(node) = self.directory.node_index(page) {
            self.directory.for_each_bucket_page(node, visit);
        }
    }

    fn find_parent(&self, page: PageId) -> ParentRef {
        if let Some(slot) = self.directory.node_index(page) {
            return ParentRef::Root { slot };
        }
        match self.directory.find_bucket_page(page) {
            Some((page, slot)) => ParentRef::Page { page, slot },
            None => ParentRef::NotFound,
        }
    }

    fn keep_in_memory(&self, page: PageId) -> bool {
        self.directory.node_index(page).is_some()
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        let mut pages = Vec::new();
        for node in 0..self.directory.node_count() {
            self.directory.for_each_bucket_page(node, &mut |pid| {
                pages.push(pid);
                true
            });
        }
        pages.extend(self.directory.node_page_ids());
        for pid in pages {
            self.pool.free_page(pid);
        }
    }
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("records", &self.len())
            .field("split_state", &self.split_state())
            .field("load_factor", &self.current_load_factor())
            .field("overflow", &self.overflow)
            .finish()
    }
}
