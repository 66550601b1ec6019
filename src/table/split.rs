//! Bucket splits and round completion
//!
//! Splitting bucket `b` of round `i` moves every key whose `hash(key, i + 1)`
//! differs from `b` into the new buddy bucket `b + N*2^i`. The splitter
//! latches `b`, builds both halves and publishes the buddy page, then claims
//! the split under the split mutex with a single compare-and-swap. The
//! rewrite of `b` happens after the claim, still under the bucket latch.
//! Another splitter skips a latched bucket and claims the next one as soon
//! as the split state moves.

use std::sync::atomic::Ordering;

use super::bucket::{new_overflow_page, BucketPage, OverflowRefs, SlottedArea, OVERFLOW_SLOTS};
use super::ops::Record;
use super::{HashTable, SplitState};
use crate::buffer::GuardMode;
use crate::constants::PAGE_SIZE;
use crate::hash::KeyHash;
use crate::heap::TupleId;
use crate::status::Restart;
use crate::utility::{retry, Backoff};

/// Bucket contents assembled off-page
struct BucketImage {
    page: Vec<u8>,
    overflow: Vec<Vec<u8>>,
}

impl BucketImage {
    fn new() -> Self {
        let mut page = vec![0u8; PAGE_SIZE];
        BucketPage::new(&mut page[..]).init();
        Self {
            page,
            overflow: Vec::new(),
        }
    }

    /// Place a record into the primary area, the first overflow page with
    /// room, or a new overflow page.
    ///
    /// Records arrive grouped by the source page they were read from. All
    /// records in an overflow page opened for a source page come from that
    /// page, so each source page opens at most one overflow page here and
    /// an image never needs more overflow pages than its source bucket had.
    fn push(&mut self, fingerprint: u16, key: &[u8], payload: &[u8]) {
        if BucketPage::new(&mut self.page[..])
            .slots_mut()
            .insert(fingerprint, key, payload)
        {
            return;
        }
        for image in &mut self.overflow {
            if SlottedArea::new(&mut image[..]).insert(fingerprint, key, payload) {
                return;
            }
        }
        self.overflow
            .push(new_overflow_page(fingerprint, key, payload));
    }

    fn set_overflow_refs(&mut self, tids: &[TupleId]) {
        let mut refs = OverflowRefs::new();
        for &tid in tids {
            refs.push(tid);
        }
        BucketPage::new(&mut self.page[..]).set_overflow_refs(&refs);
    }
}

/// Partition of one bucket, ready to be written
struct SplitPlan {
    keep: BucketImage,
    moved: BucketImage,
    kept_records: usize,
    moved_records: usize,
}

impl SplitPlan {
    fn build(pages: &[Vec<Record>], bucket: u64, base: u64, power: u32) -> Self {
        let mut plan = Self {
            keep: BucketImage::new(),
            moved: BucketImage::new(),
            kept_records: 0,
            moved_records: 0,
        };
        for (key, payload) in pages.iter().flatten() {
            let hash = KeyHash::of(key);
            if hash.bucket(base, power + 1) == bucket {
                plan.keep.push(hash.fingerprint(), key, payload);
                plan.kept_records += 1;
            } else {
                plan.moved.push(hash.fingerprint(), key, payload);
                plan.moved_records += 1;
            }
        }
        debug_assert!(plan.keep.overflow.len() <= OVERFLOW_SLOTS);
        debug_assert!(plan.moved.overflow.len() <= OVERFLOW_SLOTS);
        plan
    }
}

impl HashTable {
    /// Split the next bucket of the current round.
    ///
    /// While the round is fully claimed and its last splits are still
    /// running, waits as long as the load factor stays above the threshold.
    /// Returns false if no split was made.
    pub(super) fn split_one(&self) -> bool {
        self.split_next(false)
    }

    /// Split the next bucket to make room for a record whose bucket is full.
    ///
    /// Always waits for a claimed round to finish. Returns false only if the
    /// split could not be made.
    pub(super) fn split_for_space(&self) -> bool {
        self.split_next(true)
    }

    fn split_next(&self, wait_for_round: bool) -> bool {
        let mut backoff = Backoff::new();
        loop {
            let state = self.split_state.load();
            if state.round_claimed(self.base) {
                if !wait_for_round && self.current_load_factor() <= self.config.split_load_factor {
                    return false;
                }
                backoff.snooze();
                continue;
            }
            match self.split_bucket(state) {
                Ok(split) => return split,
                Err(Restart::Conflict) => backoff.snooze(),
                Err(Restart::Fatal(status)) => {
                    tracing::warn!(%status, bucket = state.split_in_round(self.base), "split failed");
                    return false;
                }
            }
        }
    }

    /// Split the bucket `state` names as next.
    ///
    /// Reports a conflict if another splitter holds or has claimed that
    /// bucket. Returns `Ok(false)` if the split was skipped for lack of
    /// overflow space; nothing is claimed in that case.
    fn split_bucket(&self, state: SplitState) -> Result<bool, Restart> {
        let bucket = state.split_in_round(self.base);
        let buddy = state.buddy();
        let power = state.power();

        let frame = self.directory.bucket_frame(bucket)?;
        let mut guard = frame.try_acquire_exclusive()?;
        if self.split_state.load() != state {
            return Err(Restart::Conflict);
        }

        // Nobody else can claim `bucket` while its latch is held.
        let old_refs = BucketPage::new(guard.data()).overflow_refs();
        let pages = self.collect_records(guard.data())?;
        let SplitPlan {
            mut keep,
            mut moved,
            kept_records,
            moved_records,
        } = SplitPlan::build(&pages, bucket, self.base, power);

        // Reuse the bucket's overflow tuples first, then allocate the rest.
        let keep_count = keep.overflow.len();
        let images: Vec<Vec<u8>> = std::mem::take(&mut keep.overflow)
            .into_iter()
            .chain(std::mem::take(&mut moved.overflow))
            .collect();
        let reused = old_refs.len().min(images.len());
        let mut fresh = Vec::with_capacity(images.len() - reused);
        for image in &images[reused..] {
            match self.overflow.insert(image) {
                Ok(tid) => fresh.push(tid),
                Err(status) => {
                    for tid in fresh {
                        self.free_overflow(tid);
                    }
                    self.stats.record_split_skipped();
                    tracing::warn!(bucket, %status, "split skipped: no overflow space");
                    return Ok(false);
                }
            }
        }
        let allocated = fresh.len();
        let tids: Vec<TupleId> = old_refs.as_slice()[..reused]
            .iter()
            .copied()
            .chain(fresh)
            .collect();
        let (keep_tids, moved_tids) = tids.split_at(keep_count);
        keep.set_overflow_refs(keep_tids);
        moved.set_overflow_refs(moved_tids);

        // The buddy is published before the claim; until then routing never
        // reaches it and the scan stops short of it.
        let buddy_frame = self.pool.allocate_page();
        let mut buddy_guard = retry(|| buddy_frame.acquire(GuardMode::Exclusive))?;
        buddy_guard.data_mut().copy_from_slice(&moved.page);
        buddy_guard.increment_generation();
        retry(|| self.directory.publish(buddy, buddy_frame.page_id()))?;

        {
            let _mutex = self.split_mutex.lock();
            let swapped = self.split_state.compare_exchange(state, state.claim_next());
            debug_assert!(swapped, "split state moved while the bucket was latched");
            self.splits_started.fetch_add(1, Ordering::AcqRel);
        }

        // Routing now sends moved keys to the buddy; both pages stay latched
        // until their contents and overflow tuples are final.
        guard.data_mut().copy_from_slice(&keep.page);
        guard.increment_generation();
        for (&tid, image) in tids[..reused].iter().zip(&images) {
            let status = self.overflow.lookup_for_update(tid, |bytes| {
                bytes.copy_from_slice(image);
                true
            });
            debug_assert!(status.is_ok(), "overflow tuple {tid} of a latched bucket: {status}");
        }
        let surplus = &old_refs.as_slice()[reused..];
        for &tid in surplus {
            self.free_overflow(tid);
        }
        drop(buddy_guard);
        drop(guard);

        self.stats.record_split();
        self.stats.record_overflow_allocated(allocated as u64);
        self.stats.record_overflow_freed(surplus.len() as u64);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                bucket,
                buddy,
                power,
                kept = kept_records,
                moved = moved_records,
                "bucket split"
            );
        }

        self.finish_split(state);
        Ok(true)
    }

    /// Remove an overflow tuple this split owns
    fn free_overflow(&self, tid: TupleId) {
        let status = self.overflow.remove(tid);
        debug_assert!(status.is_ok(), "overflow tuple {tid} owned by a split: {status}");
    }

    /// Count a finished split; the last split of a round advances the power.
    fn finish_split(&self, state: SplitState) {
        let round = state.round_size(self.base);
        if self.splits_finished.fetch_add(1, Ordering::AcqRel) + 1 < round {
            return;
        }

        let _mutex = self.split_mutex.lock();
        let claimed = self.split_state.load();
        debug_assert!(claimed.round_claimed(self.base));
        debug_assert_eq!(self.splits_started.load(Ordering::Acquire), round);
        self.splits_started.store(0, Ordering::Release);
        self.splits_finished.store(0, Ordering::Release);

        let advanced = claimed.next_round();
        let swapped = self.split_state.compare_exchange(claimed, advanced);
        debug_assert!(swapped, "split state moved under the split mutex");
        self.stats.record_round();
        tracing::info!(
            power = advanced.power(),
            buckets = advanced.num_buckets(),
            "split round completed"
        );
    }
}
