//! Page guards

use std::sync::atomic::Ordering;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use super::{BufferFrame, GuardMode, PageBuffer, PageId};
use crate::status::{AttemptResult, Restart};

enum Latch<'a> {
    Read(RwLockReadGuard<'a, PageBuffer>),
    Write(RwLockWriteGuard<'a, PageBuffer>),
}

/// A held page latch.
///
/// Releasing an exclusive guard bumps the frame version, which invalidates
/// every guard that observed the old version.
#[must_use = "the page latch is released when the guard drops"]
pub struct PageGuard<'a> {
    frame: &'a BufferFrame,
    mode: GuardMode,
    version: u64,
    latch: Option<Latch<'a>>,
}

impl<'a> PageGuard<'a> {
    pub(super) fn acquire(frame: &'a BufferFrame, mode: GuardMode) -> AttemptResult<Self> {
        let latch = match mode {
            GuardMode::Optimistic => match frame.latch.try_read() {
                Some(read) => Latch::Read(read),
                None => return Err(Restart::Conflict),
            },
            GuardMode::Shared => Latch::Read(frame.latch.read()),
            GuardMode::Exclusive => Latch::Write(frame.latch.write()),
        };
        Ok(Self {
            frame,
            mode,
            version: frame.version.load(Ordering::Acquire),
            latch: Some(latch),
        })
    }

    /// Exclusive guard without waiting; a held latch of any mode is a conflict
    pub(super) fn try_exclusive(frame: &'a BufferFrame) -> AttemptResult<Self> {
        let write = frame.latch.try_write().ok_or(Restart::Conflict)?;
        Ok(Self {
            frame,
            mode: GuardMode::Exclusive,
            version: frame.version.load(Ordering::Acquire),
            latch: Some(Latch::Write(write)),
        })
    }

    /// Page id of the guarded frame
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    /// Current mode
    #[inline]
    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Frame version observed at acquisition
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the page is unchanged since the guard was acquired
    #[inline]
    pub fn recheck(&self) -> bool {
        self.latch.is_some() && self.frame.version.load(Ordering::Acquire) == self.version
    }

    /// Convert into an exclusive guard.
    ///
    /// The read latch is dropped before the write latch is taken, so a writer
    /// may slip in between; that is reported as a conflict.
    pub fn upgrade_to_exclusive(&mut self) -> AttemptResult<()> {
        if self.mode == GuardMode::Exclusive {
            return Ok(());
        }
        self.latch = None;
        let write = self.frame.latch.write();
        if self.frame.version.load(Ordering::Acquire) != self.version {
            return Err(Restart::Conflict);
        }
        self.latch = Some(Latch::Write(write));
        self.mode = GuardMode::Exclusive;
        Ok(())
    }

    /// Mark the page as modified
    #[inline]
    pub fn increment_generation(&self) {
        self.frame.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Page bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        match &self.latch {
            Some(Latch::Read(read)) => read.as_slice(),
            Some(Latch::Write(write)) => write.as_slice(),
            None => panic!("page guard used after a failed upgrade"),
        }
    }

    /// Mutable page bytes. Requires an exclusive guard.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.latch {
            Some(Latch::Write(write)) => write.as_mut_slice(),
            _ => panic!("data_mut requires an exclusive page guard"),
        }
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        if let Some(Latch::Write(_)) = self.latch {
            // Still holding the write latch: readers that come after see the bump.
            self.frame.version.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("pid", &self.page_id())
            .field("mode", &self.mode)
            .field("version", &self.version)
            .finish()
    }
}
