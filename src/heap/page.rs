//! Heap page layout
//!
//! ```text
//! ┌────────┬──────────────────────┬───────────────┬──────────────────────┐
//! │ header │ slots (grow forward) │   free space  │ tuples (grow back)   │
//! └────────┴──────────────────────┴───────────────┴──────────────────────┘
//! ```
//!
//! Removed slots are not compacted. Their bytes stay reserved and can only be
//! handed to a tuple of exactly the same length.

use bytemuck::{Pod, Zeroable};

use crate::status::Status;

/// Page header
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct HeapPageHeader {
    slot_count: u16,
    /// Start of the tuple area; 0 on a page that was never initialized
    data_offset: u16,
    /// Bytes held by removed slots
    removed_bytes: u16,
    _reserved: u16,
}

/// Slot directory entry
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct HeapSlot {
    offset: u16,
    length: u16,
    state: u8,
    _padding: [u8; 3],
}

/// State of a heap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Never used
    Unused = 0,
    /// Holds a live tuple
    Occupied = 1,
    /// Tuple was removed; space reserved for a same-size tuple
    Removed = 2,
}

impl From<u8> for SlotState {
    fn from(value: u8) -> Self {
        match value {
            1 => SlotState::Occupied,
            2 => SlotState::Removed,
            _ => SlotState::Unused,
        }
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<HeapPageHeader>();

/// Size of one slot directory entry
pub const SLOT_SIZE: usize = std::mem::size_of::<HeapSlot>();

const _: () = assert!(HEADER_SIZE == 8);
const _: () = assert!(SLOT_SIZE == 8);

/// Largest tuple a page of `page_size` bytes can hold
pub const fn max_tuple_size(page_size: usize) -> usize {
    page_size - HEADER_SIZE - SLOT_SIZE
}

/// Slotted view over heap page bytes
pub struct HeapPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> HeapPage<B> {
    /// Wrap page bytes
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn header(&self) -> HeapPageHeader {
        bytemuck::pod_read_unaligned(&self.buf.as_ref()[..HEADER_SIZE])
    }

    fn slot(&self, index: usize) -> HeapSlot {
        let start = HEADER_SIZE + index * SLOT_SIZE;
        bytemuck::pod_read_unaligned(&self.buf.as_ref()[start..start + SLOT_SIZE])
    }

    /// Whether `init` ran on this page
    pub fn is_initialized(&self) -> bool {
        self.header().data_offset != 0
    }

    /// Number of slots (occupied or removed)
    pub fn slot_count(&self) -> usize {
        self.header().slot_count as usize
    }

    /// Free bytes between the slot directory and the tuple area
    pub fn contiguous_free(&self) -> usize {
        let header = self.header();
        (header.data_offset as usize)
            .saturating_sub(HEADER_SIZE + header.slot_count as usize * SLOT_SIZE)
    }

    /// Contiguous free bytes plus bytes held by removed slots
    pub fn free_space(&self) -> usize {
        self.contiguous_free() + self.header().removed_bytes as usize
    }

    /// State of slot `index`
    pub fn slot_state(&self, index: usize) -> SlotState {
        if index >= self.slot_count() {
            return SlotState::Unused;
        }
        SlotState::from(self.slot(index).state)
    }

    /// Whether a tuple of `len` bytes fits
    pub fn can_insert(&self, len: usize) -> bool {
        self.reusable_slot(len).is_some() || self.contiguous_free() >= len + SLOT_SIZE
    }

    fn reusable_slot(&self, len: usize) -> Option<usize> {
        (0..self.slot_count()).find(|&i| {
            let slot = self.slot(i);
            SlotState::from(slot.state) == SlotState::Removed && slot.length as usize == len
        })
    }

    /// Tuple bytes of an occupied slot
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        if self.slot_state(index) != SlotState::Occupied {
            return None;
        }
        let slot = self.slot(index);
        let start = slot.offset as usize;
        Some(&self.buf.as_ref()[start..start + slot.length as usize])
    }

    /// Occupied slots in slot order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        (0..self.slot_count()).filter_map(move |i| self.get(i).map(|bytes| (i, bytes)))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> HeapPage<B> {
    /// Format an empty page
    pub fn init(&mut self) {
        let page_size = self.buf.as_ref().len();
        debug_assert!(page_size <= u16::MAX as usize + 1);
        let header = HeapPageHeader {
            data_offset: page_size.min(u16::MAX as usize) as u16,
            ..Default::default()
        };
        self.write_header(header);
    }

    fn write_header(&mut self, header: HeapPageHeader) {
        self.buf.as_mut()[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    }

    fn write_slot(&mut self, index: usize, slot: HeapSlot) {
        let start = HEADER_SIZE + index * SLOT_SIZE;
        self.buf.as_mut()[start..start + SLOT_SIZE].copy_from_slice(bytemuck::bytes_of(&slot));
    }

    /// Insert a tuple. Returns the slot and whether a removed slot was reused.
    pub fn insert(&mut self, tuple: &[u8]) -> Option<(usize, bool)> {
        if let Some(index) = self.reusable_slot(tuple.len()) {
            self.fill_removed(index, tuple);
            return Some((index, true));
        }

        if self.contiguous_free() < tuple.len() + SLOT_SIZE {
            return None;
        }

        let mut header = self.header();
        let offset = header.data_offset as usize - tuple.len();
        self.buf.as_mut()[offset..offset + tuple.len()].copy_from_slice(tuple);

        let index = header.slot_count as usize;
        self.write_slot(
            index,
            HeapSlot {
                offset: offset as u16,
                length: tuple.len() as u16,
                state: SlotState::Occupied as u8,
                _padding: [0; 3],
            },
        );
        header.slot_count += 1;
        header.data_offset = offset as u16;
        self.write_header(header);
        Some((index, false))
    }

    /// Put a tuple back into a removed slot of exactly the same length.
    pub fn reinsert_at(&mut self, index: usize, tuple: &[u8]) -> Status {
        match self.slot_state(index) {
            SlotState::Unused => Status::NotFound,
            SlotState::Occupied => Status::InvalidArgument,
            SlotState::Removed => {
                if self.slot(index).length as usize != tuple.len() {
                    return Status::InvalidArgument;
                }
                self.fill_removed(index, tuple);
                Status::Ok
            }
        }
    }

    fn fill_removed(&mut self, index: usize, tuple: &[u8]) {
        let mut slot = self.slot(index);
        debug_assert_eq!(slot.length as usize, tuple.len());
        let start = slot.offset as usize;
        self.buf.as_mut()[start..start + tuple.len()].copy_from_slice(tuple);
        slot.state = SlotState::Occupied as u8;
        self.write_slot(index, slot);

        let mut header = self.header();
        header.removed_bytes -= slot.length;
        self.write_header(header);
    }

    /// Mutable tuple bytes of an occupied slot
    pub fn get_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        if self.slot_state(index) != SlotState::Occupied {
            return None;
        }
        let slot = self.slot(index);
        let start = slot.offset as usize;
        Some(&mut self.buf.as_mut()[start..start + slot.length as usize])
    }

    /// Mark a slot removed. Returns false if it held no tuple.
    pub fn remove(&mut self, index: usize) -> bool {
        if self.slot_state(index) != SlotState::Occupied {
            return false;
        }
        let mut slot = self.slot(index);
        slot.state = SlotState::Removed as u8;
        self.write_slot(index, slot);

        let mut header = self.header();
        header.removed_bytes += slot.length;
        self.write_header(header);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_page(size: usize) -> HeapPage<Vec<u8>> {
        let mut page = HeapPage::new(vec![0u8; size]);
        page.init();
        page
    }

    #[test]
    fn test_init() {
        let page = empty_page(256);
        assert!(page.is_initialized());
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.contiguous_free(), 256 - HEADER_SIZE);
        assert!(!HeapPage::new(vec![0u8; 256]).is_initialized());
    }

    #[test]
    fn test_insert_and_get() {
        let mut page = empty_page(256);
        let (a, reused) = page.insert(b"hello").unwrap();
        assert!(!reused);
        let (b, _) = page.insert(b"world!").unwrap();
        assert_ne!(a, b);
        assert_eq!(page.get(a), Some(&b"hello"[..]));
        assert_eq!(page.get(b), Some(&b"world!"[..]));
        assert_eq!(page.contiguous_free(), 256 - HEADER_SIZE - 2 * SLOT_SIZE - 11);
    }

    #[test]
    fn test_page_full() {
        let mut page = empty_page(64);
        let tuple = [1u8; 20];
        assert!(page.insert(&tuple).is_some());
        assert!(page.insert(&tuple).is_some());
        // 8 header + 2 * (20 + 8) = 64
        assert!(page.insert(&tuple).is_none());
        assert!(!page.can_insert(1));
    }

    #[test]
    fn test_remove_keeps_hole_for_same_size() {
        let mut page = empty_page(64);
        let (a, _) = page.insert(&[1u8; 20]).unwrap();
        page.insert(&[2u8; 20]).unwrap();

        assert!(page.remove(a));
        assert!(!page.remove(a));
        assert_eq!(page.get(a), None);
        assert_eq!(page.slot_state(a), SlotState::Removed);
        assert_eq!(page.free_space(), 20);

        // Different size does not fit into the hole
        assert!(page.insert(&[3u8; 19]).is_none());

        let (c, reused) = page.insert(&[3u8; 20]).unwrap();
        assert_eq!(c, a);
        assert!(reused);
        assert_eq!(page.get(c), Some(&[3u8; 20][..]));
        assert_eq!(page.free_space(), 0);
    }

    #[test]
    fn test_reinsert_at_requires_same_length() {
        let mut page = empty_page(128);
        let (a, _) = page.insert(b"abcd").unwrap();

        assert_eq!(page.reinsert_at(a, b"wxyz"), Status::InvalidArgument);
        assert!(page.remove(a));
        assert_eq!(page.reinsert_at(a, b"xyz"), Status::InvalidArgument);
        assert_eq!(page.reinsert_at(a, b"wxyz"), Status::Ok);
        assert_eq!(page.get(a), Some(&b"wxyz"[..]));
        assert_eq!(page.reinsert_at(7, b"wxyz"), Status::NotFound);
    }

    #[test]
    fn test_get_mut_and_iter() {
        let mut page = empty_page(128);
        let (a, _) = page.insert(b"aaaa").unwrap();
        let (b, _) = page.insert(b"bbbb").unwrap();
        page.get_mut(a).unwrap()[0] = b'z';
        page.remove(b);

        let tuples: Vec<_> = page.iter().map(|(i, t)| (i, t.to_vec())).collect();
        assert_eq!(tuples, vec![(a, b"zaaa".to_vec())]);
    }

    #[test]
    fn test_max_tuple_size() {
        let mut page = empty_page(128);
        let tuple = vec![9u8; max_tuple_size(128)];
        assert!(page.insert(&tuple).is_some());
        assert_eq!(page.contiguous_free(), 0);
    }
}
