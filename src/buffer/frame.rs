//! Page frames
//!
//! A frame owns one zeroed, aligned page buffer behind a reader/writer latch,
//! plus the counters page guards use for validation.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{GuardMode, PageGuard, PageId};
use crate::constants::{CACHE_LINE_BYTES, PAGE_SIZE};
use crate::status::AttemptResult;
use crate::utility::is_power_of_two;

const _: () = assert!(is_power_of_two(PAGE_SIZE as u64));

/// Zeroed page memory aligned to a cache line
pub struct PageBuffer {
    ptr: NonNull<u8>,
}

impl PageBuffer {
    const LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, CACHE_LINE_BYTES) {
        Ok(layout) => layout,
        Err(_) => panic!("invalid page layout"),
    };

    /// Allocate a zeroed page
    pub fn zeroed() -> Self {
        // SAFETY: LAYOUT has a non-zero size.
        let ptr = unsafe { alloc_zeroed(Self::LAYOUT) };
        match NonNull::new(ptr) {
            Some(ptr) => Self { ptr },
            None => std::alloc::handle_alloc_error(Self::LAYOUT),
        }
    }

    /// Page bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for PAGE_SIZE bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Mutable page bytes
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for PAGE_SIZE bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with LAYOUT in `zeroed`.
        unsafe { dealloc(self.ptr.as_ptr(), Self::LAYOUT) }
    }
}

// SAFETY: PageBuffer owns its memory exclusively; access goes through & / &mut.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

/// A resident page
pub struct BufferFrame {
    pid: PageId,
    /// Bumped on every exclusive release
    pub(super) version: AtomicU64,
    /// Bumped by `PageGuard::increment_generation` (page modified)
    pub(super) generation: AtomicU64,
    keep_in_memory: AtomicBool,
    pub(super) latch: RwLock<PageBuffer>,
}

impl BufferFrame {
    pub(super) fn new(pid: PageId) -> Self {
        Self {
            pid,
            version: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            keep_in_memory: AtomicBool::new(false),
            latch: RwLock::new(PageBuffer::zeroed()),
        }
    }

    /// Page id of this frame
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.pid
    }

    /// Acquire a guard on this page.
    ///
    /// `Optimistic` returns `Restart::Conflict` instead of waiting for a writer.
    #[inline]
    pub fn acquire(&self, mode: GuardMode) -> AttemptResult<PageGuard<'_>> {
        PageGuard::acquire(self, mode)
    }

    /// Acquire an exclusive guard if no other guard holds the page.
    #[inline]
    pub fn try_acquire_exclusive(&self) -> AttemptResult<PageGuard<'_>> {
        PageGuard::try_exclusive(self)
    }

    /// Latch version; changes whenever an exclusive guard is released
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of recorded modifications
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether the page must never be evicted
    #[inline]
    pub fn keep_in_memory(&self) -> bool {
        self.keep_in_memory.load(Ordering::Relaxed)
    }

    /// Pin or unpin the page in memory
    #[inline]
    pub fn set_keep_in_memory(&self, keep: bool) {
        self.keep_in_memory.store(keep, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("pid", &self.pid)
            .field("version", &self.version())
            .field("generation", &self.generation())
            .field("keep_in_memory", &self.keep_in_memory())
            .finish()
    }
}
