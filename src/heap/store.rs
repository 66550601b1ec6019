//! Heap store implementation

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use super::page::{max_tuple_size, HeapPage, SLOT_SIZE};
use super::{HeapConfig, HeapStats, HeapStatsSnapshot, TupleId};
use crate::buffer::{BufferFrame, BufferPool, GuardMode, PageHooks, PageId, ParentRef, Swip};
use crate::constants::PAGE_SIZE;
use crate::status::{AttemptResult, Restart, Status};
use crate::utility::retry;

/// Pages sampled from the free list before falling back to a directory scan
const FREE_LIST_SAMPLES: usize = 4;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// `(store id, page number)` this thread last inserted into
    static CANDIDATE: Cell<(u64, u64)> = const { Cell::new((0, 0)) };
}

/// Directory entry of one heap page
struct PageEntry {
    swip: Swip,
    /// Free bytes as of the last modification; a hint, not a reservation
    free_space: AtomicU32,
    /// Whether the page is on the free list
    listed: AtomicBool,
}

/// Tuple store over a growable set of heap pages.
///
/// Tuples are addressed by [`TupleId`]. A removed slot keeps its bytes and is
/// only reused by a tuple of exactly the same length.
pub struct HeapStore {
    id: u64,
    pool: Arc<BufferPool>,
    config: HeapConfig,
    pages: RwLock<Vec<Arc<PageEntry>>>,
    free_pages: RwLock<Vec<u64>>,
    grow_lock: Mutex<()>,
    growable: AtomicBool,
    stats: HeapStats,
}

impl HeapStore {
    /// Largest tuple the store accepts
    pub const MAX_TUPLE_SIZE: usize = max_tuple_size(PAGE_SIZE);

    /// Create a store backed by its own buffer pool
    pub fn new(config: HeapConfig) -> Result<Self, Status> {
        Self::with_pool(Arc::new(BufferPool::new()), config)
    }

    /// Create a store that allocates its pages from `pool`
    pub fn with_pool(pool: Arc<BufferPool>, config: HeapConfig) -> Result<Self, Status> {
        if let Some(max_pages) = config.max_pages {
            if config.initial_pages > max_pages {
                return Err(Status::InvalidArgument);
            }
        }

        let store = Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            growable: AtomicBool::new(config.growable),
            config,
            pages: RwLock::new(Vec::new()),
            free_pages: RwLock::new(Vec::new()),
            grow_lock: Mutex::new(()),
            stats: HeapStats::new(),
        };

        let initial = store.config.initial_pages;
        if initial > 0 {
            retry(|| store.add_pages(initial))?;
            store.stats.record_pages(initial as u64);
        }
        if store.config.max_pages == Some(initial) {
            store.growable.store(false, Ordering::Release);
        }
        Ok(store)
    }

    /// Configuration the store was created with
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Buffer pool backing the store
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Whether the store may still add pages
    pub fn is_growable(&self) -> bool {
        self.growable.load(Ordering::Acquire)
    }

    /// Allow or forbid growth. Once forbidden, inserts that find no space
    /// fail with [`Status::NotEnoughSpace`].
    pub fn set_growable(&self, growable: bool) {
        self.growable.store(growable, Ordering::Release);
    }

    /// Number of heap pages
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Number of live tuples
    pub fn tuple_count(&self) -> u64 {
        self.stats.tuples()
    }

    /// Free-space hint of a page
    pub fn free_space(&self, page_no: u64) -> Option<usize> {
        self.entry(page_no)
            .map(|entry| entry.free_space.load(Ordering::Relaxed) as usize)
    }

    /// Counter snapshot
    pub fn stats(&self) -> HeapStatsSnapshot {
        self.stats.snapshot()
    }

    fn entry(&self, page_no: u64) -> Option<Arc<PageEntry>> {
        self.pages.read().get(page_no as usize).map(Arc::clone)
    }

    fn hint(&self, page_no: u64) -> usize {
        self.free_space(page_no).unwrap_or(0)
    }

    fn frame(&self, page_no: u64) -> Result<Arc<BufferFrame>, Status> {
        let entry = self.entry(page_no).ok_or(Status::NotFound)?;
        retry(|| entry.swip.resolve(&self.pool))
    }

    /// Insert a tuple.
    ///
    /// Fails with [`Status::InvalidArgument`] if the tuple can never fit a page
    /// and with [`Status::NotEnoughSpace`] if the store is full and may not grow.
    pub fn insert(&self, tuple: &[u8]) -> Result<TupleId, Status> {
        if tuple.len() > Self::MAX_TUPLE_SIZE {
            return Err(Status::InvalidArgument);
        }
        retry(|| self.try_insert(tuple))
    }

    fn try_insert(&self, tuple: &[u8]) -> AttemptResult<TupleId> {
        let needed = tuple.len() + SLOT_SIZE;
        let page_no = match self.candidate_page(needed) {
            Some(page_no) => page_no,
            None => self.grow(needed)?,
        };
        self.insert_into(page_no, tuple)
    }

    fn insert_into(&self, page_no: u64, tuple: &[u8]) -> AttemptResult<TupleId> {
        let entry = self.entry(page_no).ok_or(Restart::Conflict)?;
        let frame = entry.swip.resolve(&self.pool)?;
        let mut guard = frame.acquire(GuardMode::Exclusive)?;
        let mut page = HeapPage::new(guard.data_mut());

        match page.insert(tuple) {
            Some((slot, reused)) => {
                let free = page.free_space();
                guard.increment_generation();
                drop(guard);

                self.stats.record_insert(reused);
                self.set_free_space(page_no, &entry, free);
                CANDIDATE.with(|candidate| candidate.set((self.id, page_no)));
                Ok(TupleId::new(page_no, slot as u16))
            }
            None => {
                // Lost the space to another inserter, or the free bytes are
                // in holes of the wrong size. Only contiguous space counts now.
                let free = page.contiguous_free();
                drop(guard);

                self.set_free_space(page_no, &entry, free);
                CANDIDATE.with(|candidate| {
                    if candidate.get() == (self.id, page_no) {
                        candidate.set((0, 0));
                    }
                });
                Err(Restart::Conflict)
            }
        }
    }

    /// Pick a page whose hint says `needed` bytes fit.
    fn candidate_page(&self, needed: usize) -> Option<u64> {
        let (store, page_no) = CANDIDATE.with(Cell::get);
        if store == self.id && self.hint(page_no) >= needed {
            return Some(page_no);
        }

        let sampled: Vec<u64> = {
            let list = self.free_pages.read();
            if list.is_empty() {
                Vec::new()
            } else {
                let mut rng = rand::thread_rng();
                (0..FREE_LIST_SAMPLES.min(list.len()))
                    .map(|_| list[rng.gen_range(0..list.len())])
                    .collect()
            }
        };
        if let Some(page_no) = sampled.into_iter().find(|&p| self.hint(p) >= needed) {
            CANDIDATE.with(|candidate| candidate.set((self.id, page_no)));
            return Some(page_no);
        }

        self.refill_free_list(needed)
    }

    /// Rebuild the free list from the page directory. Returns a page that
    /// fits `needed` bytes, if any.
    fn refill_free_list(&self, needed: usize) -> Option<u64> {
        let threshold = self.threshold_bytes();
        let mut found = None;
        let mut listed = Vec::new();
        {
            let pages = self.pages.read();
            for (page_no, entry) in pages.iter().enumerate() {
                let free = entry.free_space.load(Ordering::Relaxed) as usize;
                if found.is_none() && free >= needed {
                    found = Some(page_no as u64);
                }
                let keep = free >= threshold;
                entry.listed.store(keep, Ordering::Relaxed);
                if keep {
                    listed.push(page_no as u64);
                }
            }
        }
        *self.free_pages.write() = listed;
        found
    }

    fn threshold_bytes(&self) -> usize {
        (self.config.free_space_threshold * PAGE_SIZE as f64) as usize
    }

    /// Add pages after no page had room. Returns a page to insert into.
    fn grow(&self, needed: usize) -> AttemptResult<u64> {
        let _grow = self.grow_lock.lock();

        // Another thread may have grown the store while we waited.
        if let Some(page_no) = self.candidate_page(needed) {
            return Ok(page_no);
        }

        if !self.is_growable() {
            if tracing::enabled!(tracing::Level::WARN) {
                tracing::warn!(
                    store = self.id,
                    pages = self.page_count(),
                    needed,
                    "heap store is full and not growable"
                );
            }
            return Err(Restart::Fatal(Status::NotEnoughSpace));
        }

        let mut count = self.config.growth_pages.max(1);
        if let Some(max_pages) = self.config.max_pages {
            let remaining = max_pages.saturating_sub(self.page_count());
            if remaining <= count {
                count = remaining;
                self.growable.store(false, Ordering::Release);
            }
            if count == 0 {
                if tracing::enabled!(tracing::Level::WARN) {
                    tracing::warn!(store = self.id, max_pages, "heap store reached its page budget");
                }
                return Err(Restart::Fatal(Status::NotEnoughSpace));
            }
        }

        let first = self.add_pages(count)?;
        self.stats.record_growth(count as u64);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                store = self.id,
                added = count,
                pages = self.page_count(),
                growable = self.is_growable(),
                "heap store grew"
            );
        }
        Ok(first)
    }

    /// Allocate, format and list `count` pages. Returns the first page number.
    fn add_pages(&self, count: usize) -> AttemptResult<u64> {
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let frame = self.pool.allocate_page();
            let free = {
                let mut guard = frame.acquire(GuardMode::Exclusive)?;
                let mut page = HeapPage::new(guard.data_mut());
                page.init();
                let free = page.contiguous_free();
                guard.increment_generation();
                free
            };
            entries.push(Arc::new(PageEntry {
                swip: Swip::Hot(frame),
                free_space: AtomicU32::new(free as u32),
                listed: AtomicBool::new(true),
            }));
        }

        let first = {
            let mut pages = self.pages.write();
            let first = pages.len() as u64;
            pages.extend(entries);
            first
        };
        self.free_pages
            .write()
            .extend(first..first + count as u64);
        Ok(first)
    }

    fn set_free_space(&self, page_no: u64, entry: &PageEntry, free: usize) {
        entry.free_space.store(free as u32, Ordering::Relaxed);
        if free < self.threshold_bytes() && entry.listed.swap(false, Ordering::AcqRel) {
            let mut list = self.free_pages.write();
            if let Some(pos) = list.iter().position(|&p| p == page_no) {
                list.swap_remove(pos);
            }
        }
    }

    /// Re-list a page after a delete, but only inside the threshold band.
    fn readmit(&self, page_no: u64, entry: &PageEntry, free: usize) {
        entry.free_space.store(free as u32, Ordering::Relaxed);
        let fraction = free as f64 / PAGE_SIZE as f64;
        let low = self.config.free_space_threshold;
        let high = low + HeapConfig::FREE_SPACE_BAND;
        if fraction >= low && fraction <= high && !entry.listed.swap(true, Ordering::AcqRel) {
            self.free_pages.write().push(page_no);
        }
    }

    /// Read a tuple. `f` runs once, on the tuple bytes, while the page is latched.
    pub fn lookup<R>(&self, tid: TupleId, f: impl FnOnce(&[u8]) -> R) -> Result<R, Status> {
        if tid.is_invalid() {
            return Err(Status::NotFound);
        }
        let frame = self.frame(tid.page())?;
        let guard = retry(|| frame.acquire(GuardMode::Shared))?;
        let page = HeapPage::new(guard.data());
        page.get(tid.slot() as usize).map(f).ok_or(Status::NotFound)
    }

    /// Modify a tuple in place. `f` returns whether the change counts as a
    /// modification of the page.
    pub fn lookup_for_update(&self, tid: TupleId, f: impl FnOnce(&mut [u8]) -> bool) -> Status {
        if tid.is_invalid() {
            return Status::NotFound;
        }
        let frame = match self.frame(tid.page()) {
            Ok(frame) => frame,
            Err(status) => return status,
        };
        let mut guard = match retry(|| frame.acquire(GuardMode::Exclusive)) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        let mut page = HeapPage::new(guard.data_mut());
        let committed = match page.get_mut(tid.slot() as usize) {
            Some(bytes) => f(bytes),
            None => return Status::NotFound,
        };
        if committed {
            guard.increment_generation();
        }
        Status::Ok
    }

    /// Remove a tuple. The slot keeps its bytes for a same-size insert.
    pub fn remove(&self, tid: TupleId) -> Status {
        if tid.is_invalid() {
            return Status::NotFound;
        }
        let entry = match self.entry(tid.page()) {
            Some(entry) => entry,
            None => return Status::NotFound,
        };
        let frame = match retry(|| entry.swip.resolve(&self.pool)) {
            Ok(frame) => frame,
            Err(status) => return status,
        };
        let mut guard = match retry(|| frame.acquire(GuardMode::Exclusive)) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        let mut page = HeapPage::new(guard.data_mut());
        if !page.remove(tid.slot() as usize) {
            return Status::NotFound;
        }
        let free = page.free_space();
        guard.increment_generation();
        drop(guard);

        self.stats.record_remove();
        self.readmit(tid.page(), &entry, free);
        Status::Ok
    }

    /// Put a tuple back into a removed slot.
    ///
    /// The slot must be removed and the tuple must have the removed tuple's
    /// exact length, otherwise [`Status::InvalidArgument`] is returned.
    pub fn reinsert_at(&self, tid: TupleId, tuple: &[u8]) -> Status {
        if tid.is_invalid() {
            return Status::NotFound;
        }
        let entry = match self.entry(tid.page()) {
            Some(entry) => entry,
            None => return Status::NotFound,
        };
        let frame = match retry(|| entry.swip.resolve(&self.pool)) {
            Ok(frame) => frame,
            Err(status) => return status,
        };
        let mut guard = match retry(|| frame.acquire(GuardMode::Exclusive)) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        let mut page = HeapPage::new(guard.data_mut());
        let status = page.reinsert_at(tid.slot() as usize, tuple);
        if !status.is_ok() {
            return status;
        }
        let free = page.free_space();
        guard.increment_generation();
        drop(guard);

        self.stats.record_insert(true);
        self.set_free_space(tid.page(), &entry, free);
        Status::Ok
    }

    /// Visit every tuple until `f` returns false.
    pub fn scan<F>(&self, f: F)
    where
        F: FnMut(TupleId, &[u8]) -> bool,
    {
        self.scan_from(TupleId::new(0, 0), f);
    }

    /// Visit tuples starting at `start`.
    ///
    /// Returns the position to resume from when `f` stopped the scan, `None`
    /// when the scan reached the end. Each page is latched shared while its
    /// tuples are visited; `f` must not write to the store.
    pub fn scan_from<F>(&self, start: TupleId, mut f: F) -> Option<TupleId>
    where
        F: FnMut(TupleId, &[u8]) -> bool,
    {
        if start.is_invalid() {
            return None;
        }
        let page_count = self.page_count() as u64;
        let mut first_slot = start.slot() as usize;
        for page_no in start.page()..page_count {
            if let Some(resume) = self.scan_page_from(page_no, first_slot, &mut f) {
                return Some(resume);
            }
            first_slot = 0;
        }
        None
    }

    /// Visit the tuples of one page. Returns false if `f` stopped the scan.
    pub fn scan_page<F>(&self, page_no: u64, mut f: F) -> bool
    where
        F: FnMut(TupleId, &[u8]) -> bool,
    {
        self.scan_page_from(page_no, 0, &mut f).is_none()
    }

    fn scan_page_from<F>(&self, page_no: u64, first_slot: usize, f: &mut F) -> Option<TupleId>
    where
        F: FnMut(TupleId, &[u8]) -> bool,
    {
        let frame = self.frame(page_no).ok()?;
        let guard = retry(|| frame.acquire(GuardMode::Shared)).ok()?;
        let page = HeapPage::new(guard.data());
        for (slot, bytes) in page.iter().filter(|(slot, _)| *slot >= first_slot) {
            if !f(TupleId::new(page_no, slot as u16), bytes) {
                return Some(TupleId::new(page_no, slot as u16 + 1));
            }
        }
        None
    }
}

impl PageHooks for HeapStore {
    fn iterate_children(&self, _page: PageId, _visit: &mut dyn FnMut(PageId) -> bool) {
        // Heap pages hold tuples, not page references.
    }

    fn find_parent(&self, page: PageId) -> ParentRef {
        self.pages
            .read()
            .iter()
            .position(|entry| entry.swip.page_id() == page)
            .map_or(ParentRef::NotFound, |slot| ParentRef::Root { slot })
    }

    fn keep_in_memory(&self, _page: PageId) -> bool {
        false
    }
}

impl Drop for HeapStore {
    fn drop(&mut self) {
        for entry in self.pages.get_mut().drain(..) {
            self.pool.free_page(entry.swip.page_id());
        }
    }
}

impl std::fmt::Debug for HeapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapStore")
            .field("id", &self.id)
            .field("pages", &self.page_count())
            .field("tuples", &self.tuple_count())
            .field("growable", &self.is_growable())
            .finish()
    }
}
