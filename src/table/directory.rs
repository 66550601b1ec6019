//! Bucket directory
//!
//! Maps bucket numbers to bucket pages through directory pages of
//! [`DIR_NODE_BUCKET_PTR_COUNT`] page ids each. Directory pages are allocated
//! as the bucket count grows and are pinned in memory.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::{BufferFrame, BufferPool, GuardMode, PageId, Swip};
use crate::constants::PAGE_SIZE;
use crate::status::{AttemptResult, Restart};

/// Bucket page ids per directory page
pub const DIR_NODE_BUCKET_PTR_COUNT: usize = PAGE_SIZE / std::mem::size_of::<u64>();

/// Entries store `page id + 1`; zero marks an unpublished bucket.
fn read_entry(data: &[u8], slot: usize) -> Option<PageId> {
    let raw = bytemuck::cast_slice::<u8, u64>(data)[slot];
    raw.checked_sub(1)
}

fn write_entry(data: &mut [u8], slot: usize, pid: PageId) {
    bytemuck::cast_slice_mut::<u8, u64>(data)[slot] = pid + 1;
}

pub(super) struct Directory {
    pool: Arc<BufferPool>,
    nodes: RwLock<Vec<Swip>>,
}

impl Directory {
    pub(super) fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            nodes: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    fn position(bucket: u64) -> (usize, usize) {
        let bucket = bucket as usize;
        (
            bucket / DIR_NODE_BUCKET_PTR_COUNT,
            bucket % DIR_NODE_BUCKET_PTR_COUNT,
        )
    }

    /// Number of directory pages
    pub(super) fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Resolve the page of `bucket`.
    ///
    /// The directory page is read optimistically; a concurrent publish
    /// restarts the caller.
    pub(super) fn bucket_frame(&self, bucket: u64) -> AttemptResult<Arc<BufferFrame>> {
        let (node, slot) = Self::position(bucket);
        let swip = self.nodes.read().get(node).cloned().ok_or(Restart::Conflict)?;
        let frame = swip.resolve(&self.pool)?;
        let pid = {
            let guard = frame.acquire(GuardMode::Optimistic)?;
            read_entry(guard.data(), slot).ok_or(Restart::Conflict)?
        };
        Swip::Cold(pid).resolve(&self.pool)
    }

    /// Make `bucket` resolve to page `pid`
    pub(super) fn publish(&self, bucket: u64, pid: PageId) -> AttemptResult<()> {
        let (node, slot) = Self::position(bucket);
        let swip = self.node_or_grow(node);
        let frame = swip.resolve(&self.pool)?;
        let mut guard = frame.acquire(GuardMode::Exclusive)?;
        write_entry(guard.data_mut(), slot, pid);
        guard.increment_generation();
        Ok(())
    }

    fn node_or_grow(&self, node: usize) -> Swip {
        if let Some(swip) = self.nodes.read().get(node) {
            return swip.clone();
        }
        let mut nodes = self.nodes.write();
        while nodes.len() <= node {
            let frame = self.pool.allocate_page();
            frame.set_keep_in_memory(true);
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(node = nodes.len(), pid = frame.page_id(), "directory page allocated");
            }
            nodes.push(Swip::Hot(frame));
        }
        nodes[node].clone()
    }

    /// Position of a directory page in the node list
    pub(super) fn node_index(&self, pid: PageId) -> Option<usize> {
        self.nodes
            .read()
            .iter()
            .position(|swip| swip.page_id() == pid)
    }

    /// Visit the bucket pages referenced by directory page `node`
    pub(super) fn for_each_bucket_page(&self, node: usize, visit: &mut dyn FnMut(PageId) -> bool) {
        let Some(swip) = self.nodes.read().get(node).cloned() else {
            return;
        };
        let Ok(frame) = swip.resolve(&self.pool) else {
            return;
        };
        let pids: Vec<PageId> = {
            let guard = match frame.acquire(GuardMode::Shared) {
                Ok(guard) => guard,
                Err(_) => return,
            };
            (0..DIR_NODE_BUCKET_PTR_COUNT)
                .filter_map(|slot| read_entry(guard.data(), slot))
                .collect()
        };
        for pid in pids {
            if !visit(pid) {
                return;
            }
        }
    }

    /// Directory page and slot referencing bucket page `pid`
    pub(super) fn find_bucket_page(&self, pid: PageId) -> Option<(PageId, usize)> {
        let nodes: Vec<Swip> = self.nodes.read().clone();
        for swip in nodes {
            let Ok(frame) = swip.resolve(&self.pool) else {
                continue;
            };
            let Ok(guard) = frame.acquire(GuardMode::Shared) else {
                continue;
            };
            let found = (0..DIR_NODE_BUCKET_PTR_COUNT)
                .find(|&slot| read_entry(guard.data(), slot) == Some(pid));
            if let Some(slot) = found {
                return Some((swip.page_id(), slot));
            }
        }
        None
    }

    /// All directory page ids
    pub(super) fn node_page_ids(&self) -> Vec<PageId> {
        self.nodes.read().iter().map(Swip::page_id).collect()
    }
}
