//! Shared memory region mapping and on-region layout.
//!
//! A region is a file mapped `MAP_SHARED` into every participating process.
//! The full reservation is mapped at creation; pages fault in lazily, so a
//! large region costs only what is actually touched. The file itself is the
//! pin: processes unmap on detach but never unlink, so the region survives
//! arbitrary process churn until an operator tears it down.
//!
//! # Layout
//!
//! ```text
//! +---------------+---------------------+------------------------------+
//! | RegionHeader  | Partition directory |            Heap              |
//! +---------------+---------------------+------------------------------+
//! ```
//!
//! - **Header**: magic, version, init state, bucketer parameters, and the
//!   arena's lock, watermark, and free lists.
//! - **Partition directory**: one [`PartitionShared`] per table partition.
//! - **Heap**: arena-managed storage for entries, labels, bucket arrays.
//!
//! Everything in the region is addressed by offset from the mapping base,
//! never by raw pointer; the base differs per process.

use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64};

/// Identifies a region file as ours ("shmetric").
pub(crate) const REGION_MAGIC: u64 = 0x7368_6d65_7472_6963;

/// Bumped whenever the on-region layout changes.
pub(crate) const REGION_VERSION: u32 = 1;

/// Region init states, stored in the header.
pub(crate) const STATE_RAW: u32 = 0;
pub(crate) const STATE_INITIALIZING: u32 = 1;
pub(crate) const STATE_READY: u32 = 2;

/// Number of arena size classes (powers of two starting at 16 bytes).
pub(crate) const NUM_SIZE_CLASSES: usize = 32;

/// Region header, at offset zero of every region.
///
/// All fields are atomics: the header is concurrently visible to every
/// attached process, and zero-initialized mapping pages give every field a
/// valid starting value. Most fields are written once during init and read
/// with `Relaxed` thereafter; `state` is the publication point and uses
/// Acquire/Release.
#[repr(C)]
pub(crate) struct RegionHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub state: AtomicU32,
    pub region_size: AtomicU64,
    pub partitions: AtomicU32,
    pub initial_buckets: AtomicU32,
    /// Bit pattern of the bucket variability (f64).
    pub variability_bits: AtomicU64,
    /// Effective histogram upper bound (already rounded to a boundary).
    pub upper_bound: AtomicI64,
    /// Offset where the arena heap begins.
    pub heap_start: AtomicU64,
    /// Arena spinlock guarding watermark and free lists.
    pub arena_lock: AtomicU32,
    _pad: AtomicU32,
    /// Bump pointer: offset of the next unallocated heap byte.
    pub watermark: AtomicU64,
    /// Bytes currently allocated (live), for observability.
    pub bytes_live: AtomicU64,
    /// Free-list heads per size class (block offsets, 0 = empty).
    pub free_heads: [AtomicU64; NUM_SIZE_CLASSES],
}

/// Per-partition shared state, in the partition directory.
#[repr(C)]
pub(crate) struct PartitionShared {
    /// Partition spinlock. Guards the bucket array, chain links, entry
    /// fields, and the counters below.
    pub lock: AtomicU32,
    _pad: AtomicU32,
    /// Arena offset of the bucket array (`bucket_count` chain heads).
    pub buckets: AtomicU64,
    /// Number of buckets; always a power of two.
    pub bucket_count: AtomicU64,
    /// Number of entries in this partition.
    pub entries: AtomicU64,
}

#[inline]
fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Offset of the partition directory.
pub(crate) fn partition_dir_offset() -> usize {
    round_up(mem::size_of::<RegionHeader>(), 64)
}

/// Offset of the heap for a given partition count.
pub(crate) fn heap_start(partitions: usize) -> usize {
    round_up(
        partition_dir_offset() + partitions * mem::size_of::<PartitionShared>(),
        64,
    )
}

/// A mapped shared memory region.
///
/// Dropping a `SharedRegion` unmaps this process's view. It never unlinks
/// the backing file and never clears the contents; the region is owned
/// collectively, not by any single attacher.
pub(crate) struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
    path: Option<PathBuf>,
}

// Safety: the region is raw shared memory; all concurrent access goes
// through atomics or is serialized by the in-region locks.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the backing file if absent and map it.
    ///
    /// The first creator fixes the file size; an existing file is mapped
    /// at its current extent and never resized, so every process maps the
    /// same range regardless of its local `len`.
    pub fn create_file(path: &Path, len: usize) -> io::Result<Self> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => {
                file.set_len(len as u64)?;
                file
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                OpenOptions::new().read(true).write(true).open(path)?
            }
            Err(e) => return Err(e),
        };

        let map_len = file.metadata()?.len() as usize;
        Self::map_fd(&file, map_len, Some(path.to_path_buf()))
    }

    /// Map an existing backing file at its current size.
    pub fn open_file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        Self::map_fd(&file, len, Some(path.to_path_buf()))
    }

    /// Map an anonymous shared region.
    ///
    /// Anonymous regions are shared only with forked children; they back
    /// unit tests and have no pin to manage.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self {
            base,
            len,
            path: None,
        })
    }

    fn map_fd(file: &std::fs::File, len: usize, path: Option<PathBuf>) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;

        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region file is empty",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { base, len, path })
    }

    /// Remove the backing file. Existing mappings stay valid until every
    /// process unmaps; new attachments will fail. Operational teardown only.
    pub fn unlink(path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    /// Path of the backing file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The region header.
    pub fn header(&self) -> &RegionHeader {
        // Safety: the mapping is page-aligned and at least MIN_REGION_SIZE,
        // and RegionHeader is valid for all bit patterns (all atomics).
        unsafe { &*(self.base.as_ptr() as *const RegionHeader) }
    }

    /// Shared state for partition `index`.
    pub fn partition(&self, index: usize) -> &PartitionShared {
        debug_assert!(index < self.partition_count());
        let offset = partition_dir_offset() + index * mem::size_of::<PartitionShared>();
        // Safety: offset is within the mapping for any validated partition
        // count, and PartitionShared is valid for all bit patterns.
        unsafe { &*(self.base.as_ptr().add(offset) as *const PartitionShared) }
    }

    /// Partition count recorded in the header.
    pub fn partition_count(&self) -> usize {
        self.header()
            .partitions
            .load(std::sync::atomic::Ordering::Relaxed) as usize
    }

    /// Resolve an offset to an address in this process's mapping.
    ///
    /// The resulting pointer is only meaningful inside the critical section
    /// that produced the offset; it must never be stored back into shared
    /// memory or held past the lock.
    #[inline]
    pub fn resolve(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset > 0 && (offset as usize) < self.len, "bad offset");
        // Safety: offset was produced by the arena and is within the mapping.
        unsafe { self.base.as_ptr().add(offset as usize) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let result = libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            debug_assert_eq!(result, 0, "munmap failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_anonymous_region_is_zeroed() {
        let region = SharedRegion::anonymous(1024 * 1024).unwrap();
        let header = region.header();
        assert_eq!(header.magic.load(Ordering::Relaxed), 0);
        assert_eq!(header.state.load(Ordering::Relaxed), STATE_RAW);
        assert_eq!(header.watermark.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_layout_offsets_are_aligned() {
        assert_eq!(partition_dir_offset() % 64, 0);
        assert_eq!(heap_start(128) % 64, 0);
        assert!(heap_start(128) > partition_dir_offset());
    }

    #[test]
    fn test_file_backed_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        {
            let region = SharedRegion::create_file(&path, 1024 * 1024).unwrap();
            region.header().magic.store(REGION_MAGIC, Ordering::Release);
        }

        let region = SharedRegion::open_file(&path).unwrap();
        assert_eq!(region.len(), 1024 * 1024);
        assert_eq!(region.header().magic.load(Ordering::Acquire), REGION_MAGIC);

        SharedRegion::unlink(&path).unwrap();
        assert!(SharedRegion::open_file(&path).is_err());
    }

    #[test]
    fn test_create_file_never_resizes_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        drop(SharedRegion::create_file(&path, 1024 * 1024).unwrap());

        // A later opener asking for more (or less) maps the original extent.
        let bigger = SharedRegion::create_file(&path, 4 * 1024 * 1024).unwrap();
        assert_eq!(bigger.len(), 1024 * 1024);
        let smaller = SharedRegion::create_file(&path, 1024 * 1024 / 2).unwrap();
        assert_eq!(smaller.len(), 1024 * 1024);
    }

    #[test]
    fn test_mutation_visible_through_second_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let a = SharedRegion::create_file(&path, 1024 * 1024).unwrap();
        let b = SharedRegion::open_file(&path).unwrap();

        a.header().upper_bound.store(12345, Ordering::Release);
        assert_eq!(b.header().upper_bound.load(Ordering::Acquire), 12345);
    }
}
