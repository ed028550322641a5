//! Offset-based allocator over the shared region heap.
//!
//! Allocations are addressed by offset from the mapping base, never by
//! pointer, so they are portable across every attached process. Blocks are
//! power-of-two size classes with per-class free lists threaded through
//! the freed blocks themselves; a bump watermark serves classes whose free
//! list is empty. A single spinlock in the region header guards the
//! watermark and free lists — allocation is rare (first sight of a key,
//! bucket array growth) compared to value mutation, which never takes it.
//!
//! Offset 0 is the null sentinel: the heap begins well past the header, so
//! no allocation can ever be at offset zero.

use std::sync::atomic::Ordering;

use crate::error::{MetricsError, MetricsResult};
use crate::region::{SharedRegion, NUM_SIZE_CLASSES};
use crate::sync;

/// Smallest block is `1 << MIN_BLOCK_SHIFT` = 16 bytes.
const MIN_BLOCK_SHIFT: usize = 4;

/// Per-block header: a u64 holding the block's size class.
const BLOCK_HEADER: usize = 8;

/// Map a total block requirement to a size class, or `None` if the request
/// exceeds the largest class.
fn size_class(total: usize) -> Option<usize> {
    let needed = total.max(1 << MIN_BLOCK_SHIFT);
    let shift = needed.checked_next_power_of_two()?.trailing_zeros() as usize;
    let class = shift - MIN_BLOCK_SHIFT;
    (class < NUM_SIZE_CLASSES).then_some(class)
}

#[inline]
fn class_size(class: usize) -> usize {
    1 << (class + MIN_BLOCK_SHIFT)
}

/// Allocator view over a region. Cheap to construct; all state lives in
/// the region header.
pub(crate) struct Arena<'a> {
    region: &'a SharedRegion,
}

impl<'a> Arena<'a> {
    pub fn new(region: &'a SharedRegion) -> Self {
        Self { region }
    }

    /// Allocate `size` bytes, returning the payload offset.
    ///
    /// The payload of a recycled block contains stale bytes; callers must
    /// fully initialize it (or use [`allocate_zeroed`](Self::allocate_zeroed)).
    pub fn allocate(&self, size: usize) -> MetricsResult<u64> {
        let header = self.region.header();
        let total = size
            .checked_add(BLOCK_HEADER)
            .ok_or(MetricsError::OutOfSharedMemory)?;
        let class = size_class(total).ok_or(MetricsError::OutOfSharedMemory)?;
        let block_size = class_size(class);

        let _guard = sync::lock(&header.arena_lock);

        let block = {
            let head = header.free_heads[class].load(Ordering::Relaxed);
            if head != 0 {
                // Pop the free list; next link lives in the payload.
                let next = unsafe { *(self.region.resolve(head + BLOCK_HEADER as u64) as *const u64) };
                header.free_heads[class].store(next, Ordering::Relaxed);
                head
            } else {
                let watermark = header.watermark.load(Ordering::Relaxed);
                debug_assert!(watermark != 0, "arena used before region init");
                let end = watermark + block_size as u64;
                // Capacity is the creator's recorded size, not the local
                // mapping, so every process refuses the same offsets.
                if end > header.region_size.load(Ordering::Relaxed) {
                    return Err(MetricsError::OutOfSharedMemory);
                }
                header.watermark.store(end, Ordering::Relaxed);
                watermark
            }
        };

        // Safety: block is within the mapping and 16-aligned; the arena
        // lock serializes all block header writes.
        unsafe {
            *(self.region.resolve(block) as *mut u64) = class as u64;
        }
        header
            .bytes_live
            .fetch_add(block_size as u64, Ordering::Relaxed);

        Ok(block + BLOCK_HEADER as u64)
    }

    /// Allocate and zero-fill `size` bytes.
    pub fn allocate_zeroed(&self, size: usize) -> MetricsResult<u64> {
        let offset = self.allocate(size)?;
        // Safety: offset..offset+size was just allocated and is exclusive
        // to this caller until published.
        unsafe {
            std::ptr::write_bytes(self.region.resolve(offset), 0, size);
        }
        Ok(offset)
    }

    /// Return a payload offset to its size-class free list.
    pub fn free(&self, offset: u64) {
        debug_assert!(offset as usize > BLOCK_HEADER);
        let header = self.region.header();
        let block = offset - BLOCK_HEADER as u64;

        // Safety: offset was produced by allocate(), so the block header
        // precedes it and holds the class.
        let class = unsafe { *(self.region.resolve(block) as *const u64) } as usize;
        debug_assert!(class < NUM_SIZE_CLASSES, "corrupt block header");

        let _guard = sync::lock(&header.arena_lock);

        let head = header.free_heads[class].load(Ordering::Relaxed);
        // Safety: the payload is dead (caller relinquished it); reuse its
        // first word for the free-list link.
        unsafe {
            *(self.region.resolve(offset) as *mut u64) = head;
        }
        header.free_heads[class].store(block, Ordering::Relaxed);
        header
            .bytes_live
            .fetch_sub(class_size(class) as u64, Ordering::Relaxed);
    }

    /// Resolve a payload offset to a local address. See
    /// [`SharedRegion::resolve`] for the validity constraints.
    #[inline]
    pub fn resolve(&self, offset: u64) -> *mut u8 {
        self.region.resolve(offset)
    }

    /// Bytes currently allocated across all classes.
    pub fn bytes_live(&self) -> u64 {
        self.region.header().bytes_live.load(Ordering::Relaxed)
    }
}
