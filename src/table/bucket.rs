//! Bucket and overflow page formats
//!
//! Both use the same slotted record area:
//!
//! ```text
//! ┌────────┬──────────────────────┬──────────┬──────────────────────────┐
//! │ header │ slots (grow forward) │   free   │ key|payload (grow back)  │
//! └────────┴──────────────────────┴──────────┴──────────────────────────┘
//! ```
//!
//! A bucket page prefixes the area with a bounded array of overflow tuple
//! ids. An overflow page is a bare area stored as one heap tuple.

use bytemuck::{Pod, Zeroable};

use crate::constants::PAGE_SIZE;
use crate::heap::{max_tuple_size, TupleId, SLOT_SIZE as HEAP_SLOT_SIZE};

/// Overflow tuple ids per bucket
pub const OVERFLOW_SLOTS: usize = 8;

/// Overflow pages sharing one heap page
const OVERFLOW_PAGES_PER_HEAP_PAGE: usize = 4;

/// Size of an overflow page (one heap tuple)
pub const OVERFLOW_PAGE_SIZE: usize =
    ((max_tuple_size(PAGE_SIZE) + HEAP_SLOT_SIZE) / OVERFLOW_PAGES_PER_HEAP_PAGE - HEAP_SLOT_SIZE)
        & !7;

const REFS_SIZE: usize = OVERFLOW_SLOTS * std::mem::size_of::<u64>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct AreaHeader {
    count: u16,
    /// Start of the record data; 0 until `init`
    data_offset: u16,
    /// Key and payload bytes of all live records
    space_used: u16,
    _reserved: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct RecordSlot {
    fingerprint: u16,
    key_len: u16,
    payload_len: u16,
    offset: u16,
}

const AREA_HEADER_SIZE: usize = std::mem::size_of::<AreaHeader>();

/// Per-record slot overhead
pub const RECORD_SLOT_SIZE: usize = std::mem::size_of::<RecordSlot>();

/// Record bytes (slots included) a bucket page holds without overflow
pub const BUCKET_CAPACITY: usize = PAGE_SIZE - REFS_SIZE - AREA_HEADER_SIZE;

/// Record bytes (slots included) an overflow page holds
pub const OVERFLOW_CAPACITY: usize = OVERFLOW_PAGE_SIZE - AREA_HEADER_SIZE;

/// Largest key plus payload the table accepts
pub const MAX_RECORD_SIZE: usize = OVERFLOW_CAPACITY - RECORD_SLOT_SIZE;

const _: () = assert!(OVERFLOW_PAGE_SIZE == 1008);
const _: () = assert!(AREA_HEADER_SIZE == 8 && RECORD_SLOT_SIZE == 8);
const _: () = assert!(PAGE_SIZE <= u16::MAX as usize);

/// Slotted record area
pub struct SlottedArea<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> SlottedArea<B> {
    /// Wrap area bytes
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn header(&self) -> AreaHeader {
        bytemuck::pod_read_unaligned(&self.buf.as_ref()[..AREA_HEADER_SIZE])
    }

    fn slot(&self, index: usize) -> RecordSlot {
        let start = AREA_HEADER_SIZE + index * RECORD_SLOT_SIZE;
        bytemuck::pod_read_unaligned(&self.buf.as_ref()[start..start + RECORD_SLOT_SIZE])
    }

    /// Bytes available to slots and records
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().len() - AREA_HEADER_SIZE
    }

    /// Number of records
    pub fn count(&self) -> usize {
        self.header().count as usize
    }

    /// Key and payload bytes of all records
    pub fn space_used(&self) -> usize {
        self.header().space_used as usize
    }

    /// Record bytes including slot overhead
    pub fn used_bytes(&self) -> usize {
        self.count() * RECORD_SLOT_SIZE + self.space_used()
    }

    /// Free bytes between the slots and the record data
    pub fn contiguous_free(&self) -> usize {
        let header = self.header();
        (header.data_offset as usize)
            .saturating_sub(AREA_HEADER_SIZE + header.count as usize * RECORD_SLOT_SIZE)
    }

    /// Free bytes after compaction
    pub fn free_space(&self) -> usize {
        self.capacity() - self.used_bytes()
    }

    /// Whether a record of this size fits, compacting if necessary
    pub fn fits(&self, key_len: usize, payload_len: usize) -> bool {
        self.free_space() >= key_len + payload_len + RECORD_SLOT_SIZE
    }

    /// Find a record: fingerprint first, then the full key
    pub fn find(&self, fingerprint: u16, key: &[u8]) -> Option<usize> {
        (0..self.count()).find(|&i| {
            let slot = self.slot(i);
            slot.fingerprint == fingerprint
                && slot.key_len as usize == key.len()
                && self.key(i) == key
        })
    }

    /// Fingerprint of record `index`
    pub fn fingerprint(&self, index: usize) -> u16 {
        self.slot(index).fingerprint
    }

    /// Key of record `index`
    pub fn key(&self, index: usize) -> &[u8] {
        let slot = self.slot(index);
        let start = slot.offset as usize;
        &self.buf.as_ref()[start..start + slot.key_len as usize]
    }

    /// Payload of record `index`
    pub fn payload(&self, index: usize) -> &[u8] {
        let slot = self.slot(index);
        let start = slot.offset as usize + slot.key_len as usize;
        &self.buf.as_ref()[start..start + slot.payload_len as usize]
    }

    /// All records as `(key, payload)`
    pub fn records(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.count()).map(move |i| (self.key(i), self.payload(i)))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedArea<B> {
    /// Format an empty area
    pub fn init(&mut self) {
        let header = AreaHeader {
            data_offset: self.buf.as_ref().len() as u16,
            ..Default::default()
        };
        self.write_header(header);
    }

    fn write_header(&mut self, header: AreaHeader) {
        self.buf.as_mut()[..AREA_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    }

    fn write_slot(&mut self, index: usize, slot: RecordSlot) {
        let start = AREA_HEADER_SIZE + index * RECORD_SLOT_SIZE;
        self.buf.as_mut()[start..start + RECORD_SLOT_SIZE]
            .copy_from_slice(bytemuck::bytes_of(&slot));
    }

    /// Insert a record, compacting first if the free bytes are fragmented.
    /// Returns false if it does not fit.
    pub fn insert(&mut self, fingerprint: u16, key: &[u8], payload: &[u8]) -> bool {
        if !self.fits(key.len(), payload.len()) {
            return false;
        }
        if self.contiguous_free() < key.len() + payload.len() + RECORD_SLOT_SIZE {
            self.compact();
        }
        self.append(fingerprint, key, payload);
        true
    }

    fn append(&mut self, fingerprint: u16, key: &[u8], payload: &[u8]) {
        let mut header = self.header();
        let len = key.len() + payload.len();
        let offset = header.data_offset as usize - len;
        let data = self.buf.as_mut();
        data[offset..offset + key.len()].copy_from_slice(key);
        data[offset + key.len()..offset + len].copy_from_slice(payload);

        self.write_slot(
            header.count as usize,
            RecordSlot {
                fingerprint,
                key_len: key.len() as u16,
                payload_len: payload.len() as u16,
                offset: offset as u16,
            },
        );
        header.count += 1;
        header.data_offset = offset as u16;
        header.space_used += len as u16;
        self.write_header(header);
    }

    /// Remove record `index`. Later slots shift down; the record bytes stay
    /// behind until the next compaction.
    pub fn remove(&mut self, index: usize) {
        let mut header = self.header();
        debug_assert!(index < header.count as usize);
        let slot = self.slot(index);

        let start = AREA_HEADER_SIZE + (index + 1) * RECORD_SLOT_SIZE;
        let end = AREA_HEADER_SIZE + header.count as usize * RECORD_SLOT_SIZE;
        self.buf
            .as_mut()
            .copy_within(start..end, start - RECORD_SLOT_SIZE);

        header.count -= 1;
        header.space_used -= slot.key_len + slot.payload_len;
        if header.count == 0 {
            header.data_offset = self.buf.as_ref().len() as u16;
        }
        self.write_header(header);
    }

    /// Rewrite all records contiguously at the end of the area
    pub fn compact(&mut self) {
        let records: Vec<(u16, usize, Vec<u8>)> = (0..self.count())
            .map(|i| {
                let slot = self.slot(i);
                let start = slot.offset as usize;
                let len = (slot.key_len + slot.payload_len) as usize;
                (
                    slot.fingerprint,
                    slot.key_len as usize,
                    self.buf.as_ref()[start..start + len].to_vec(),
                )
            })
            .collect();

        self.init();
        for (fingerprint, key_len, bytes) in records {
            let (key, payload) = bytes.split_at(key_len);
            self.append(fingerprint, key, payload);
        }
    }

    /// Mutable payload of record `index`
    pub fn payload_mut(&mut self, index: usize) -> &mut [u8] {
        let slot = self.slot(index);
        let start = slot.offset as usize + slot.key_len as usize;
        &mut self.buf.as_mut()[start..start + slot.payload_len as usize]
    }
}

/// Overflow tuple ids of a bucket, in array order
#[derive(Debug, Clone, Copy)]
pub struct OverflowRefs {
    refs: [TupleId; OVERFLOW_SLOTS],
    len: usize,
}

impl OverflowRefs {
    /// Empty list
    pub const fn new() -> Self {
        Self {
            refs: [TupleId::INVALID; OVERFLOW_SLOTS],
            len: 0,
        }
    }

    /// Append; returns false when all slots are taken
    pub fn push(&mut self, tid: TupleId) -> bool {
        if self.len == OVERFLOW_SLOTS {
            return false;
        }
        self.refs[self.len] = tid;
        self.len += 1;
        true
    }

    /// Number of overflow pages
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the bucket has no overflow pages
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether no more overflow pages can be added
    pub fn is_full(&self) -> bool {
        self.len == OVERFLOW_SLOTS
    }

    /// The ids
    pub fn as_slice(&self) -> &[TupleId] {
        &self.refs[..self.len]
    }
}

impl Default for OverflowRefs {
    fn default() -> Self {
        Self::new()
    }
}

/// Bucket page: overflow ids followed by a slotted area
pub struct BucketPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> BucketPage<B> {
    /// Wrap page bytes
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    /// Overflow pages of this bucket
    pub fn overflow_refs(&self) -> OverflowRefs {
        let mut refs = OverflowRefs::new();
        for chunk in self.buf.as_ref()[..REFS_SIZE].chunks_exact(8) {
            let tid = TupleId::from_raw(bytemuck::pod_read_unaligned(chunk));
            if tid.is_invalid() {
                break;
            }
            refs.push(tid);
        }
        refs
    }

    /// Primary record area
    pub fn slots(&self) -> SlottedArea<&[u8]> {
        SlottedArea::new(&self.buf.as_ref()[REFS_SIZE..])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BucketPage<B> {
    /// Format an empty bucket
    pub fn init(&mut self) {
        self.set_overflow_refs(&OverflowRefs::new());
        self.slots_mut().init();
    }

    /// Mutable primary record area
    pub fn slots_mut(&mut self) -> SlottedArea<&mut [u8]> {
        SlottedArea::new(&mut self.buf.as_mut()[REFS_SIZE..])
    }

    /// Replace the overflow array
    pub fn set_overflow_refs(&mut self, refs: &OverflowRefs) {
        let out = &mut self.buf.as_mut()[..REFS_SIZE];
        for (i, chunk) in out.chunks_exact_mut(8).enumerate() {
            let tid = refs.as_slice().get(i).copied().unwrap_or(TupleId::INVALID);
            chunk.copy_from_slice(&tid.raw().to_ne_bytes());
        }
    }

    /// Append an overflow page; returns false when all slots are taken
    pub fn push_overflow(&mut self, tid: TupleId) -> bool {
        let mut refs = self.overflow_refs();
        if !refs.push(tid) {
            return false;
        }
        self.set_overflow_refs(&refs);
        true
    }

    /// Drop the overflow page at `position`, keeping the array dense
    pub fn remove_overflow(&mut self, position: usize) {
        let current = self.overflow_refs();
        let mut refs = OverflowRefs::new();
        for (i, tid) in current.as_slice().iter().enumerate() {
            if i != position {
                refs.push(*tid);
            }
        }
        self.set_overflow_refs(&refs);
    }
}

/// Build a fresh overflow page holding one record
pub fn new_overflow_page(fingerprint: u16, key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; OVERFLOW_PAGE_SIZE];
    let mut area = SlottedArea::new(&mut image[..]);
    area.init();
    let inserted = area.insert(fingerprint, key, payload);
    debug_assert!(inserted, "record larger than MAX_RECORD_SIZE");
    image
}
