//! Partitioned concurrent hash table over the shared arena.
//!
//! The table is a fixed set of lock partitions, each a chained hash table
//! whose bucket array and entries live in the arena. A key's hash selects
//! its partition (high bits) and its bucket within the partition (low
//! bits), so operations on keys in different partitions never contend.
//!
//! Growth is per partition: when a partition's load factor passes 1, its
//! bucket array doubles and chains are relinked in place — entries never
//! move, so no offset held by any process is invalidated, and the rehash
//! blast radius is a single partition lock.
//!
//! There is no global lock anywhere. A scan visits partitions one at a
//! time, copying entries out under each partition's lock in turn, so it
//! observes per-partition-consistent state that is only weakly consistent
//! across the whole table. That is the deliberate tradeoff that keeps
//! write throughput flat as the table grows.

use std::mem;
use std::sync::atomic::Ordering;

use ahash::RandomState;

use crate::arena::Arena;
use crate::error::{MetricsError, MetricsResult};
use crate::key::{MetricKind, SearchKey, MAX_NAME_LEN};
use crate::labels::LabelSet;
use crate::region::{PartitionShared, SharedRegion};
use crate::stats;
use crate::sync::{self, SpinGuard};

/// Buckets per partition at creation. Partitions grow independently.
pub(crate) const INITIAL_BUCKETS: usize = 8;

/// A stored metric entry. Lives in the arena; every field is read or
/// written only while the owning partition's lock is held.
#[repr(C)]
struct EntrySlot {
    /// Offset of the next entry in the chain (0 = end).
    next: u64,
    /// Cached key hash; compared before the full key.
    hash: u64,
    /// The 64-bit value cell.
    value: i64,
    /// Histogram bucket boundary; 0 for every other kind.
    bucket: i64,
    /// Arena offset of the canonical label bytes (0 = absent).
    labels_off: u64,
    labels_len: u64,
    /// Raw MetricKind discriminant.
    kind: u32,
    name_len: u32,
    name: [u8; MAX_NAME_LEN],
}

/// A copied-out metric entry, returned by scans.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name.
    pub name: String,
    /// Labels, restored to structured form; `None` when recorded without.
    pub labels: Option<LabelSet>,
    /// Entry kind.
    pub kind: MetricKind,
    /// Bucket boundary for `HistogramBucket` entries, 0 otherwise.
    pub bucket: i64,
    /// Value at the time the entry's partition was visited.
    pub value: i64,
}

/// RAII handle to a found-or-inserted entry.
///
/// Holds the entry's partition lock; value access is only possible through
/// this guard, which releases the lock on drop — on every exit path.
pub(crate) struct EntryGuard<'a> {
    _lock: SpinGuard<'a>,
    entry: *mut EntrySlot,
}

impl EntryGuard<'_> {
    /// Current value.
    pub fn value(&self) -> i64 {
        // Safety: the partition lock is held for the guard's lifetime.
        unsafe { (*self.entry).value }
    }

    /// Add a (possibly negative) delta, returning the new value.
    pub fn add(&mut self, delta: i64) -> i64 {
        // Safety: as above; the lock makes this read-modify-write atomic
        // with respect to every other process.
        unsafe {
            let v = (*self.entry).value.wrapping_add(delta);
            (*self.entry).value = v;
            v
        }
    }

    /// Overwrite the value (gauge set semantics), returning it.
    pub fn set(&mut self, value: i64) -> i64 {
        // Safety: as above.
        unsafe {
            (*self.entry).value = value;
        }
        value
    }
}

/// Table view over a region. Cheap to construct per operation.
pub(crate) struct Table<'a> {
    region: &'a SharedRegion,
    hasher: &'a RandomState,
}

impl<'a> Table<'a> {
    pub fn new(region: &'a SharedRegion, hasher: &'a RandomState) -> Self {
        Self { region, hasher }
    }

    /// Lay out the partition directory and initial bucket arrays in a
    /// fresh region. The header's partition count and watermark must be
    /// set before calling.
    pub fn initialize(region: &SharedRegion, partitions: usize) -> MetricsResult<()> {
        let arena = Arena::new(region);
        for index in 0..partitions {
            let offset = arena.allocate_zeroed(INITIAL_BUCKETS * 8)?;
            let part = region.partition(index);
            part.buckets.store(offset, Ordering::Relaxed);
            part.bucket_count
                .store(INITIAL_BUCKETS as u64, Ordering::Relaxed);
            part.entries.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    #[inline]
    fn partition_for(&self, hash: u64) -> &'a PartitionShared {
        let count = self.region.partition_count();
        let index = ((hash >> 32) as usize) & (count - 1);
        self.region.partition(index)
    }

    /// Locate or create the entry for `key`, returning it with its
    /// partition lock held.
    ///
    /// On create: the key is copied into a fresh arena slot, a local label
    /// reference is promoted to a shared allocation, and the value starts
    /// at zero. An arena failure leaves the table untouched.
    pub fn find_or_insert(&self, key: &SearchKey<'_>) -> MetricsResult<(EntryGuard<'a>, bool)> {
        let hash = key.hash(self.hasher);
        let part = self.partition_for(hash);
        let lock = sync::lock(&part.lock);

        if let Some(entry) = self.lookup_locked(part, hash, key) {
            return Ok((EntryGuard { _lock: lock, entry }, false));
        }

        let arena = Arena::new(self.region);
        let entries = part.entries.load(Ordering::Relaxed);
        if entries + 1 > part.bucket_count.load(Ordering::Relaxed) {
            self.grow_locked(part, &arena);
        }

        let entry_off = arena.allocate(mem::size_of::<EntrySlot>())?;

        let (labels_off, labels_len) = match key.labels {
            Some(bytes) => {
                let off = match arena.allocate(bytes.len()) {
                    Ok(off) => off,
                    Err(e) => {
                        arena.free(entry_off);
                        return Err(e);
                    }
                };
                // Safety: freshly allocated, exclusively ours until linked.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        arena.resolve(off),
                        bytes.len(),
                    );
                }
                (off, bytes.len() as u64)
            }
            None => (0, 0),
        };

        let entry = arena.resolve(entry_off) as *mut EntrySlot;
        let name_bytes = key.name.as_bytes();
        debug_assert!(name_bytes.len() <= MAX_NAME_LEN);

        // Chain head may have moved if grow_locked ran; reload it.
        let bucket_count = part.bucket_count.load(Ordering::Relaxed);
        let buckets = part.buckets.load(Ordering::Relaxed);
        let cell = self.bucket_cell(buckets, hash, bucket_count);

        // Safety: the slot is unpublished until the chain-head store below,
        // and the partition lock is held throughout.
        unsafe {
            (*entry).next = *cell;
            (*entry).hash = hash;
            (*entry).value = 0;
            (*entry).bucket = key.bucket;
            (*entry).labels_off = labels_off;
            (*entry).labels_len = labels_len;
            (*entry).kind = key.kind as u32;
            (*entry).name_len = name_bytes.len() as u32;
            (*entry).name = [0; MAX_NAME_LEN];
            std::ptr::copy_nonoverlapping(
                name_bytes.as_ptr(),
                std::ptr::addr_of_mut!((*entry).name) as *mut u8,
                name_bytes.len(),
            );
            *cell = entry_off;
        }
        part.entries.store(entries + 1, Ordering::Relaxed);
        stats::ENTRIES_CREATED.increment();

        Ok((EntryGuard { _lock: lock, entry }, true))
    }

    /// Locate the entry for `key` without inserting.
    pub fn find(&self, key: &SearchKey<'_>) -> Option<EntryGuard<'a>> {
        let hash = key.hash(self.hasher);
        let part = self.partition_for(hash);
        let lock = sync::lock(&part.lock);

        self.lookup_locked(part, hash, key)
            .map(|entry| EntryGuard { _lock: lock, entry })
    }

    /// Copy every entry out of the table, one partition lock at a time.
    pub fn scan(&self) -> MetricsResult<Vec<Metric>> {
        let mut out = Vec::new();

        for index in 0..self.region.partition_count() {
            let part = self.region.partition(index);
            let _lock = sync::lock(&part.lock);

            let bucket_count = part.bucket_count.load(Ordering::Relaxed);
            let buckets = part.buckets.load(Ordering::Relaxed);

            for bucket in 0..bucket_count {
                // Safety: bucket array and chains are guarded by the lock.
                let mut cur = unsafe { *(self.region.resolve(buckets + bucket * 8) as *const u64) };
                while cur != 0 {
                    let entry = self.region.resolve(cur) as *const EntrySlot;
                    // Safety: entry is live while the lock is held; the
                    // copy below is what outlives the critical section.
                    unsafe {
                        out.push(self.copy_entry(&*entry)?);
                        cur = (*entry).next;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Delete every entry matching `name` and `labels` (canonical bytes,
    /// `None` for absent), across all kinds and buckets. Frees label
    /// allocations before unlinking slots. Returns the count deleted.
    pub fn delete_matching(&self, name: &str, labels: Option<&[u8]>) -> u64 {
        let arena = Arena::new(self.region);
        let mut deleted = 0;

        for index in 0..self.region.partition_count() {
            let part = self.region.partition(index);
            let _lock = sync::lock(&part.lock);

            let bucket_count = part.bucket_count.load(Ordering::Relaxed);
            let buckets = part.buckets.load(Ordering::Relaxed);

            for bucket in 0..bucket_count {
                let mut link = self.region.resolve(buckets + bucket * 8) as *mut u64;
                // Safety: all chain traversal below is under the lock.
                unsafe {
                    let mut cur = *link;
                    while cur != 0 {
                        let entry = self.region.resolve(cur) as *mut EntrySlot;
                        let next = (*entry).next;
                        if self.name_labels_match(&*entry, name, labels) {
                            *link = next;
                            self.free_entry(&arena, cur, entry);
                            part.entries.fetch_sub(1, Ordering::Relaxed);
                            deleted += 1;
                        } else {
                            link = std::ptr::addr_of_mut!((*entry).next);
                        }
                        cur = next;
                    }
                }
            }
        }
        deleted
    }

    /// Delete every entry in the table. Returns the count deleted.
    pub fn clear(&self) -> u64 {
        let arena = Arena::new(self.region);
        let mut deleted = 0;

        for index in 0..self.region.partition_count() {
            let part = self.region.partition(index);
            let _lock = sync::lock(&part.lock);

            let bucket_count = part.bucket_count.load(Ordering::Relaxed);
            let buckets = part.buckets.load(Ordering::Relaxed);

            for bucket in 0..bucket_count {
                let cell = self.region.resolve(buckets + bucket * 8) as *mut u64;
                // Safety: under the partition lock.
                unsafe {
                    let mut cur = *cell;
                    while cur != 0 {
                        let entry = self.region.resolve(cur) as *mut EntrySlot;
                        let next = (*entry).next;
                        self.free_entry(&arena, cur, entry);
                        deleted += 1;
                        cur = next;
                    }
                    *cell = 0;
                }
            }
            part.entries.store(0, Ordering::Relaxed);
        }
        deleted
    }

    /// Total entries across all partitions (racy snapshot, stats only).
    pub fn len(&self) -> u64 {
        (0..self.region.partition_count())
            .map(|i| self.region.partition(i).entries.load(Ordering::Relaxed))
            .sum()
    }

    #[inline]
    fn bucket_cell(&self, buckets: u64, hash: u64, bucket_count: u64) -> *mut u64 {
        let index = hash & (bucket_count - 1);
        self.region.resolve(buckets + index * 8) as *mut u64
    }

    fn lookup_locked(
        &self,
        part: &PartitionShared,
        hash: u64,
        key: &SearchKey<'_>,
    ) -> Option<*mut EntrySlot> {
        let bucket_count = part.bucket_count.load(Ordering::Relaxed);
        let buckets = part.buckets.load(Ordering::Relaxed);

        // Safety: chain traversal under the caller-held partition lock.
        unsafe {
            let mut cur = *self.bucket_cell(buckets, hash, bucket_count);
            while cur != 0 {
                let entry = self.region.resolve(cur) as *mut EntrySlot;
                if (*entry).hash == hash && self.key_matches(&*entry, key) {
                    return Some(entry);
                }
                cur = (*entry).next;
            }
        }
        None
    }

    /// Full key comparison after a hash match. Labels compare as canonical
    /// bytes whether the search side is local or absent; the stored side
    /// is always a shared (arena) reference.
    fn key_matches(&self, entry: &EntrySlot, key: &SearchKey<'_>) -> bool {
        if entry.kind != key.kind as u32 || entry.bucket != key.bucket {
            return false;
        }
        if self.entry_name(entry) != key.name.as_bytes() {
            return false;
        }
        self.entry_labels(entry) == key.labels.unwrap_or(&[])
    }

    fn name_labels_match(&self, entry: &EntrySlot, name: &str, labels: Option<&[u8]>) -> bool {
        self.entry_name(entry) == name.as_bytes()
            && self.entry_labels(entry) == labels.unwrap_or(&[])
    }

    fn entry_name<'e>(&self, entry: &'e EntrySlot) -> &'e [u8] {
        &entry.name[..entry.name_len as usize]
    }

    /// Canonical label bytes of a stored entry (empty for absent).
    ///
    /// The returned slice aliases the arena and is only valid while the
    /// entry's partition lock is held.
    fn entry_labels(&self, entry: &EntrySlot) -> &[u8] {
        if entry.labels_off == 0 {
            return &[];
        }
        // Safety: the allocation is live as long as the entry is, and the
        // partition lock pins the entry.
        unsafe {
            std::slice::from_raw_parts(
                self.region.resolve(entry.labels_off),
                entry.labels_len as usize,
            )
        }
    }

    fn copy_entry(&self, entry: &EntrySlot) -> MetricsResult<Metric> {
        let name = std::str::from_utf8(self.entry_name(entry))
            .map_err(|_| MetricsError::Corrupted)?
            .to_owned();
        let kind = MetricKind::from_raw(entry.kind).ok_or(MetricsError::Corrupted)?;
        let labels = if entry.labels_off != 0 {
            Some(LabelSet::from_canonical(self.entry_labels(entry))?)
        } else {
            None
        };
        Ok(Metric {
            name,
            labels,
            kind,
            bucket: entry.bucket,
            value: entry.value,
        })
    }

    /// Free an entry slot and its label allocation. The entry must already
    /// be unlinked (or about to be, under the same lock).
    unsafe fn free_entry(&self, arena: &Arena<'_>, entry_off: u64, entry: *mut EntrySlot) {
        // Safety: caller holds the partition lock and owns the unlink.
        unsafe {
            if (*entry).labels_off != 0 {
                arena.free((*entry).labels_off);
            }
        }
        arena.free(entry_off);
    }

    /// Double this partition's bucket array and relink its chains.
    ///
    /// Entries stay where they are; only the chain heads move, so offsets
    /// held by other processes remain valid. If the arena can't supply the
    /// new array the partition simply keeps its longer chains.
    fn grow_locked(&self, part: &PartitionShared, arena: &Arena<'_>) {
        let old_count = part.bucket_count.load(Ordering::Relaxed);
        let old_off = part.buckets.load(Ordering::Relaxed);
        let new_count = old_count * 2;

        let new_off = match arena.allocate_zeroed((new_count * 8) as usize) {
            Ok(off) => off,
            Err(_) => {
                tracing::debug!(new_count, "bucket array growth deferred: arena exhausted");
                return;
            }
        };

        // Safety: both arrays and all chains are private to this partition
        // and the lock is held.
        unsafe {
            for bucket in 0..old_count {
                let mut cur = *(self.region.resolve(old_off + bucket * 8) as *const u64);
                while cur != 0 {
                    let entry = self.region.resolve(cur) as *mut EntrySlot;
                    let next = (*entry).next;
                    let cell = self.bucket_cell(new_off, (*entry).hash, new_count);
                    (*entry).next = *cell;
                    *cell = cur;
                    cur = next;
                }
            }
        }

        part.buckets.store(new_off, Ordering::Relaxed);
        part.bucket_count.store(new_count, Ordering::Relaxed);
        arena.free(old_off);
    }
}
