//! Page frames, page guards and the page pool
//!
//! This is the narrow slice of a buffer manager that the heap store and the
//! hash table are written against:
//!
//! - [`BufferPool`] hands out fixed-size page frames addressed by [`PageId`].
//! - [`BufferFrame::acquire`] returns a [`PageGuard`] in one of three
//!   [`GuardMode`]s. Optimistic acquisition never blocks; it reports a
//!   conflict instead.
//! - [`Swip`] is a page reference that is either resolved (`Hot`) or only an
//!   identifier (`Cold`) that must be faulted in through the pool.
//! - [`PageHooks`] is implemented by page owners so an eviction manager can
//!   walk the page graph.
//!
//! Eviction itself is not implemented: every allocated page stays resident
//! until freed.

mod frame;
mod guard;
mod hooks;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::status::{AttemptResult, Restart, Status};

pub use frame::{BufferFrame, PageBuffer};
pub use guard::PageGuard;
pub use hooks::{PageHooks, ParentRef};

/// Identifier of a page frame
pub type PageId = u64;

/// How a page guard holds its page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Non-blocking read; fails with a conflict if a writer holds the page
    Optimistic,
    /// Blocking shared read
    Shared,
    /// Blocking exclusive write
    Exclusive,
}

/// A page reference: either swizzled to a resident frame or an identifier
#[derive(Debug, Clone)]
pub enum Swip {
    /// Resident frame
    Hot(Arc<BufferFrame>),
    /// Identifier that must be resolved through the pool
    Cold(PageId),
}

impl Swip {
    /// Page id behind the reference
    pub fn page_id(&self) -> PageId {
        match self {
            Swip::Hot(frame) => frame.page_id(),
            Swip::Cold(pid) => *pid,
        }
    }

    /// Whether the reference is already resolved
    pub fn is_hot(&self) -> bool {
        matches!(self, Swip::Hot(_))
    }

    /// Resolve to a frame, faulting cold references in through `pool`.
    ///
    /// A page that is not resident is reported as a conflict: the caller
    /// restarts and re-reads the reference.
    pub fn resolve(&self, pool: &BufferPool) -> AttemptResult<Arc<BufferFrame>> {
        match self {
            Swip::Hot(frame) => Ok(Arc::clone(frame)),
            Swip::Cold(pid) => pool.resolve(*pid).ok_or(Restart::Conflict),
        }
    }
}

/// Resident page frames addressed by page id
pub struct BufferPool {
    frames: RwLock<Vec<Option<Arc<BufferFrame>>>>,
    free_ids: Mutex<Vec<PageId>>,
}

impl BufferPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            frames: RwLock::new(Vec::new()),
            free_ids: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a zeroed page frame
    pub fn allocate_page(&self) -> Arc<BufferFrame> {
        if let Some(pid) = self.free_ids.lock().pop() {
            let frame = Arc::new(BufferFrame::new(pid));
            let mut frames = self.frames.write();
            frames[pid as usize] = Some(Arc::clone(&frame));
            return frame;
        }

        let mut frames = self.frames.write();
        let pid = frames.len() as PageId;
        let frame = Arc::new(BufferFrame::new(pid));
        frames.push(Some(Arc::clone(&frame)));
        frame
    }

    /// Look up a resident frame
    pub fn resolve(&self, pid: PageId) -> Option<Arc<BufferFrame>> {
        self.frames
            .read()
            .get(pid as usize)
            .and_then(|slot| slot.as_ref().map(Arc::clone))
    }

    /// Release a page. Holders of the frame keep their reference; later
    /// resolves of `pid` fail until the id is reused.
    pub fn free_page(&self, pid: PageId) -> Status {
        let mut frames = self.frames.write();
        match frames.get_mut(pid as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                drop(frames);
                self.free_ids.lock().push(pid);
                Status::Ok
            }
            _ => Status::NotFound,
        }
    }

    /// Number of resident pages
    pub fn page_count(&self) -> usize {
        self.frames.read().iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("pages", &self.page_count())
            .finish()
    }
}
