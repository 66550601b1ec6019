//! Point operations and scan

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::bucket::{new_overflow_page, BucketPage, SlottedArea, MAX_RECORD_SIZE, RECORD_SLOT_SIZE};
use super::{HashTable, SplitState};
use crate::buffer::{BufferFrame, GuardMode, PageGuard};
use crate::hash::KeyHash;
use crate::heap::TupleId;
use crate::locks::VersionGuard;
use crate::status::{AttemptResult, Restart, Status};
use crate::utility::Backoff;

/// An owned `(key, payload)` pair
pub(super) type Record = (Vec<u8>, Vec<u8>);

/// Bytes a record takes in a slotted area
#[inline]
fn footprint(key_len: usize, payload_len: usize) -> u64 {
    (key_len + payload_len + RECORD_SLOT_SIZE) as u64
}

enum Upserted {
    Inserted,
    Replaced { old_len: usize },
}

impl HashTable {
    /// Run attempts until one commits
    pub(super) fn run<T>(&self, mut attempt: impl FnMut() -> AttemptResult<T>) -> Result<T, Status> {
        let mut backoff = Backoff::new();
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(Restart::Conflict) => {
                    self.stats.record_restart();
                    backoff.snooze();
                }
                Err(Restart::Fatal(status)) => return Err(status),
            }
        }
    }

    /// Run attempts like [`run`](Self::run); an attempt that finds the key's
    /// bucket full returns `None`, and the next bucket of the round is split
    /// before trying again.
    fn run_growing<T>(
        &self,
        mut attempt: impl FnMut() -> AttemptResult<Option<T>>,
    ) -> Result<T, Status> {
        loop {
            if let Some(value) = self.run(&mut attempt)? {
                return Ok(value);
            }
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(split_state = ?self.split_state.load(), "bucket full, splitting");
            }
            if !self.split_for_space() {
                return Err(Status::NotEnoughSpace);
            }
        }
    }

    fn locate(&self, hash: KeyHash) -> AttemptResult<(SplitState, Arc<BufferFrame>)> {
        let state = self.split_state.load();
        let bucket = state.route(hash, self.base);
        let frame = self.directory.bucket_frame(bucket)?;
        Ok((state, frame))
    }

    /// Re-read the split state once the bucket is latched. A split that ran
    /// between routing and latching may have moved the key.
    #[inline]
    fn validate_route(&self, state: SplitState) -> AttemptResult<()> {
        if self.split_state.load() == state {
            Ok(())
        } else {
            Err(Restart::Conflict)
        }
    }

    fn check_record(key: &[u8], payload_len: usize) -> Result<(), Status> {
        if key.len() + payload_len > MAX_RECORD_SIZE {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    fn record_added(&self, key_len: usize, payload_len: usize) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.record_bytes
            .fetch_add(footprint(key_len, payload_len), Ordering::Relaxed);
    }

    fn record_removed(&self, key_len: usize, payload_len: usize) {
        self.records.fetch_sub(1, Ordering::Relaxed);
        self.record_bytes
            .fetch_sub(footprint(key_len, payload_len), Ordering::Relaxed);
    }

    fn maybe_split(&self) {
        if self.current_load_factor() > self.config.split_load_factor {
            self.split_one();
        }
    }

    pub(super) fn read_overflow<R>(
        &self,
        tid: TupleId,
        f: impl FnOnce(&SlottedArea<&[u8]>) -> R,
    ) -> Result<R, Status> {
        self.overflow.lookup(tid, |bytes| f(&SlottedArea::new(bytes)))
    }

    fn modify_overflow<R>(
        &self,
        tid: TupleId,
        f: impl FnOnce(&mut SlottedArea<&mut [u8]>) -> Option<R>,
    ) -> Result<Option<R>, Status> {
        let mut out = None;
        let status = self.overflow.lookup_for_update(tid, |bytes| {
            out = f(&mut SlottedArea::new(bytes));
            out.is_some()
        });
        status.into_result().map(|()| out)
    }

    /// Every record of a latched bucket page, grouped by the page holding
    /// it: the primary area first, then each overflow page in order.
    pub(super) fn collect_records(&self, data: &[u8]) -> Result<Vec<Vec<Record>>, Status> {
        fn owned(area: &SlottedArea<&[u8]>) -> Vec<Record> {
            area.records()
                .map(|(key, payload)| (key.to_vec(), payload.to_vec()))
                .collect()
        }

        let page = BucketPage::new(data);
        let refs = page.overflow_refs();
        let mut pages = Vec::with_capacity(1 + refs.len());
        pages.push(owned(&page.slots()));
        for &tid in refs.as_slice() {
            pages.push(self.read_overflow(tid, owned)?);
        }
        Ok(pages)
    }

    /// Look up `key` and pass its payload to `f`.
    ///
    /// `f` runs once, after the read was validated, with no latch held.
    pub fn lookup(&self, key: &[u8], f: impl FnOnce(&[u8])) -> Status {
        match self.read_record(key) {
            Ok(Some(payload)) => {
                f(&payload);
                Status::Ok
            }
            Ok(None) => Status::NotFound,
            Err(status) => status,
        }
    }

    /// Copy of the payload stored under `key`
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.read_record(key).ok().flatten()
    }

    fn read_record(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Status> {
        let hash = KeyHash::of(key);
        let result = self.run(|| {
            let mut lock = self.locks.acquire(hash);
            if !lock.read_lock() {
                return Err(Restart::Conflict);
            }
            let found = self.try_lookup(key, hash)?;
            if !lock.validate() {
                return Err(Restart::Conflict);
            }
            Ok(found)
        });
        if let Ok(found) = &result {
            self.stats.record_lookup(found.is_some());
        }
        result
    }

    fn try_lookup(&self, key: &[u8], hash: KeyHash) -> AttemptResult<Option<Vec<u8>>> {
        let (state, frame) = self.locate(hash)?;
        let guard = frame.acquire(GuardMode::Optimistic)?;
        self.validate_route(state)?;

        let fingerprint = hash.fingerprint();
        let page = BucketPage::new(guard.data());
        let slots = page.slots();
        if let Some(index) = slots.find(fingerprint, key) {
            return Ok(Some(slots.payload(index).to_vec()));
        }
        for &tid in page.overflow_refs().as_slice() {
            let found = self.read_overflow(tid, |area| {
                area.find(fingerprint, key)
                    .map(|index| area.payload(index).to_vec())
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Insert a record.
    ///
    /// Duplicates are not checked; use [`upsert`](Self::upsert) to replace.
    /// A full bucket makes the table split until the record fits.
    /// Fails with [`Status::InvalidArgument`] if key plus payload exceed
    /// [`MAX_RECORD_SIZE`], and with [`Status::NotEnoughSpace`] if the
    /// overflow store cannot provide a page for the record or for a split.
    pub fn insert(&self, key: &[u8], payload: &[u8]) -> Status {
        if let Err(status) = Self::check_record(key, payload.len()) {
            return status;
        }
        let hash = KeyHash::of(key);
        let lock = self.locks.lock_exclusive(hash);
        let result = self.run_growing(|| self.try_insert(key, payload, hash));
        drop(lock);

        match result {
            Ok(()) => {
                self.record_added(key.len(), payload.len());
                self.stats.record_insert();
                self.maybe_split();
                Status::Ok
            }
            Err(status) => status,
        }
    }

    fn try_insert(&self, key: &[u8], payload: &[u8], hash: KeyHash) -> AttemptResult<Option<()>> {
        let (state, frame) = self.locate(hash)?;
        let mut guard = frame.acquire(GuardMode::Exclusive)?;
        self.validate_route(state)?;
        let placed = self.insert_locked(&mut guard, hash.fingerprint(), key, payload)?;
        Ok(placed.then_some(()))
    }

    /// Place a record into a latched bucket: primary area, then existing
    /// overflow pages, then a new overflow page. Returns false if the primary
    /// area and every overflow slot are full.
    fn insert_locked(
        &self,
        guard: &mut PageGuard<'_>,
        fingerprint: u16,
        key: &[u8],
        payload: &[u8],
    ) -> AttemptResult<bool> {
        let mut page = BucketPage::new(guard.data_mut());
        if page.slots_mut().insert(fingerprint, key, payload) {
            guard.increment_generation();
            return Ok(true);
        }

        let refs = page.overflow_refs();
        for &tid in refs.as_slice() {
            let inserted = self.modify_overflow(tid, |area| {
                area.insert(fingerprint, key, payload).then_some(())
            })?;
            if inserted.is_some() {
                return Ok(true);
            }
        }

        if refs.is_full() {
            return Ok(false);
        }
        let tid = self
            .overflow
            .insert(&new_overflow_page(fingerprint, key, payload))?;
        page.push_overflow(tid);
        guard.increment_generation();
        self.stats.record_overflow_allocated(1);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                page = guard.page_id(),
                overflow = %tid,
                overflow_pages = refs.len() + 1,
                "overflow page allocated"
            );
        }
        Ok(true)
    }

    /// Modify the payload of `key` in place. The payload length is fixed.
    pub fn update(&self, key: &[u8], f: impl FnOnce(&mut [u8])) -> Status {
        let hash = KeyHash::of(key);
        let lock = self.locks.lock_exclusive(hash);
        let mut f = Some(f);
        let result = self.run(|| self.try_update(key, hash, &mut f));
        drop(lock);

        match result {
            Ok(true) => {
                self.stats.record_update();
                Status::Ok
            }
            Ok(false) => Status::NotFound,
            Err(status) => status,
        }
    }

    fn try_update<F>(&self, key: &[u8], hash: KeyHash, f: &mut Option<F>) -> AttemptResult<bool>
    where
        F: FnOnce(&mut [u8]),
    {
        let (state, frame) = self.locate(hash)?;
        let mut guard = frame.acquire(GuardMode::Exclusive)?;
        self.validate_route(state)?;

        let fingerprint = hash.fingerprint();
        let mut page = BucketPage::new(guard.data_mut());
        let mut slots = page.slots_mut();
        if let Some(index) = slots.find(fingerprint, key) {
            if let Some(f) = f.take() {
                f(slots.payload_mut(index));
            }
            guard.increment_generation();
            return Ok(true);
        }

        for &tid in page.overflow_refs().as_slice() {
            let found = self.modify_overflow(tid, |area| {
                let index = area.find(fingerprint, key)?;
                if let Some(f) = f.take() {
                    f(area.payload_mut(index));
                }
                Some(())
            })?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Insert `key`, or replace its payload if present
    pub fn upsert(&self, key: &[u8], payload: &[u8]) -> Status {
        if let Err(status) = Self::check_record(key, payload.len()) {
            return status;
        }
        let hash = KeyHash::of(key);
        let lock = self.locks.lock_exclusive(hash);
        let result = self.run_growing(|| self.try_upsert(key, payload, hash));
        drop(lock);

        match result {
            Ok(Upserted::Inserted) => {
                self.record_added(key.len(), payload.len());
                self.stats.record_upsert();
                self.maybe_split();
                Status::Ok
            }
            Ok(Upserted::Replaced { old_len }) => {
                self.record_bytes
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                self.record_bytes
                    .fetch_sub(old_len as u64, Ordering::Relaxed);
                self.stats.record_upsert();
                if payload.len() > old_len {
                    self.maybe_split();
                }
                Status::Ok
            }
            Err(status) => status,
        }
    }

    fn try_upsert(
        &self,
        key: &[u8],
        payload: &[u8],
        hash: KeyHash,
    ) -> AttemptResult<Option<Upserted>> {
        let (state, frame) = self.locate(hash)?;
        let mut guard = frame.acquire(GuardMode::Exclusive)?;
        self.validate_route(state)?;

        let fingerprint = hash.fingerprint();
        if self.overwrite_locked(&mut guard, fingerprint, key, payload)? {
            return Ok(Some(Upserted::Replaced {
                old_len: payload.len(),
            }));
        }

        // From here on nothing restarts: insert_locked only fails fatally.
        let Some(old) = self.remove_locked(&mut guard, fingerprint, key)? else {
            let placed = self.insert_locked(&mut guard, fingerprint, key, payload)?;
            return Ok(placed.then_some(Upserted::Inserted));
        };
        let outcome = self.insert_locked(&mut guard, fingerprint, key, payload);
        if let Ok(true) = outcome {
            return Ok(Some(Upserted::Replaced { old_len: old.len() }));
        }

        // The old record fit here a moment ago, unless its overflow page was
        // released and the store cannot hand out a new one.
        match self.insert_locked(&mut guard, fingerprint, key, &old) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.record_removed(key.len(), old.len());
                tracing::warn!(len = old.len(), "upsert could not restore the previous payload");
            }
        }
        outcome.map(|_| None)
    }

    /// Overwrite the payload of `key` if it has the same length.
    /// Returns false if the key is absent or its payload length differs.
    fn overwrite_locked(
        &self,
        guard: &mut PageGuard<'_>,
        fingerprint: u16,
        key: &[u8],
        payload: &[u8],
    ) -> AttemptResult<bool> {
        let mut page = BucketPage::new(guard.data_mut());
        let mut slots = page.slots_mut();
        if let Some(index) = slots.find(fingerprint, key) {
            let target = slots.payload_mut(index);
            if target.len() != payload.len() {
                return Ok(false);
            }
            target.copy_from_slice(payload);
            guard.increment_generation();
            return Ok(true);
        }

        for &tid in page.overflow_refs().as_slice() {
            let outcome = self.modify_overflow(tid, |area| {
                let index = area.find(fingerprint, key)?;
                let target = area.payload_mut(index);
                if target.len() != payload.len() {
                    return None;
                }
                target.copy_from_slice(payload);
                Some(())
            })?;
            if outcome.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove `key`
    pub fn remove(&self, key: &[u8]) -> Status {
        let hash = KeyHash::of(key);
        let lock = self.locks.lock_exclusive(hash);
        let result = self.run(|| self.try_remove(key, hash));
        drop(lock);

        match result {
            Ok(Some(old)) => {
                self.record_removed(key.len(), old.len());
                self.stats.record_remove();
                Status::Ok
            }
            Ok(None) => Status::NotFound,
            Err(status) => status,
        }
    }

    fn try_remove(&self, key: &[u8], hash: KeyHash) -> AttemptResult<Option<Vec<u8>>> {
        let (state, frame) = self.locate(hash)?;
        let mut guard = frame.acquire(GuardMode::Exclusive)?;
        self.validate_route(state)?;
        self.remove_locked(&mut guard, hash.fingerprint(), key)
    }

    /// Remove a record from a latched bucket. An overflow page left empty is
    /// released to the heap store. Returns the old payload.
    fn remove_locked(
        &self,
        guard: &mut PageGuard<'_>,
        fingerprint: u16,
        key: &[u8],
    ) -> AttemptResult<Option<Vec<u8>>> {
        let mut page = BucketPage::new(guard.data_mut());
        let mut slots = page.slots_mut();
        if let Some(index) = slots.find(fingerprint, key) {
            let old = slots.payload(index).to_vec();
            slots.remove(index);
            guard.increment_generation();
            return Ok(Some(old));
        }

        let refs = page.overflow_refs();
        for (position, &tid) in refs.as_slice().iter().enumerate() {
            let removed = self.modify_overflow(tid, |area| {
                let index = area.find(fingerprint, key)?;
                let old = area.payload(index).to_vec();
                area.remove(index);
                Some((old, area.count() == 0))
            })?;
            if let Some((old, now_empty)) = removed {
                if now_empty {
                    self.overflow.remove(tid).into_result()?;
                    page.remove_overflow(position);
                    guard.increment_generation();
                    self.stats.record_overflow_freed(1);
                }
                return Ok(Some(old));
            }
        }
        Ok(None)
    }

    /// Visit every record until `f` returns false.
    ///
    /// Buckets are copied one at a time under a shared latch and `f` runs with
    /// no latch held, so it may call back into the table. A record moved by a
    /// concurrent split can be visited twice; a record present for the whole
    /// scan is visited at least once.
    ///
    /// Returns [`Status::Ok`] when the scan reached the end or `f` stopped it,
    /// and the failing status if a bucket could not be read.
    pub fn scan(&self, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> Status {
        let mut bucket = 0;
        loop {
            let records = match self.run(|| self.snapshot_bucket(bucket)) {
                Ok(Some(records)) => records,
                Ok(None) => return Status::Ok,
                Err(status) => {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(bucket, %status, "scan stopped");
                    }
                    return status;
                }
            };
            for (key, payload) in &records {
                if !f(key, payload) {
                    return Status::Ok;
                }
            }
            bucket += 1;
        }
    }

    pub(super) fn snapshot_bucket(&self, bucket: u64) -> AttemptResult<Option<Vec<Record>>> {
        if bucket >= self.split_state.load().num_buckets() {
            return Ok(None);
        }
        let frame = self.directory.bucket_frame(bucket)?;
        let guard = frame.acquire(GuardMode::Shared)?;
        let pages = self.collect_records(guard.data())?;
        Ok(Some(pages.into_iter().flatten().collect()))
    }
}
