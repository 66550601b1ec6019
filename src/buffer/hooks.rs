//! Hooks a page owner exposes to an eviction/recovery manager

use super::PageId;

/// Where the reference to a page lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRef {
    /// The page is referenced from the owner's root (not from another page)
    Root {
        /// Position in the root's reference list
        slot: usize,
    },
    /// The page is referenced from slot `slot` of page `page`
    Page {
        /// Parent page
        page: PageId,
        /// Position of the reference inside the parent
        slot: usize,
    },
    /// The owner does not know this page
    NotFound,
}

/// Callbacks the owner of a set of pages implements for the buffer manager.
///
/// Durability is handled elsewhere; the checkpoint, serialization and
/// undo/redo hooks default to no-ops.
pub trait PageHooks {
    /// Visit every page referenced by `page`. Stop early when `visit` returns false.
    fn iterate_children(&self, page: PageId, visit: &mut dyn FnMut(PageId) -> bool);

    /// Resolve the reference that points at `page`
    fn find_parent(&self, page: PageId) -> ParentRef;

    /// Whether `page` must stay resident
    fn keep_in_memory(&self, page: PageId) -> bool;

    /// Copy `page` into `dst` for writing out
    fn checkpoint(&self, _page: PageId, _dst: &mut [u8]) {}

    /// Serialize owner metadata
    fn serialize(&self, _out: &mut Vec<u8>) {}

    /// Restore owner metadata
    fn deserialize(&self, _bytes: &[u8]) {}

    /// Undo a logged change
    fn undo(&self, _entry: &[u8]) {}

    /// Redo a logged change against `page`
    fn redo(&self, _page: PageId, _entry: &[u8]) {}
}
