//! Synchronization primitives for shared memory.
//!
//! The lock words live inside the mapped region, so they must work across
//! independent processes. A plain userspace mutex won't do (its queue state
//! is process-local), so partitions and the arena use a word-sized spinlock
//! over an `AtomicU32`. Critical sections are single-entry and short by
//! design, which keeps spinning acceptable.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Spin loop hint for busy waiting.
#[inline]
pub(crate) fn spin_loop() {
    std::hint::spin_loop();
}

/// Acquire a shared-memory spinlock, returning an RAII guard.
///
/// The lock word must be zero-initialized (fresh region pages are). The
/// Acquire/Release pairing on the word is what makes entry mutations done
/// under the lock visible to every other attached process.
#[inline]
pub(crate) fn lock(word: &AtomicU32) -> SpinGuard<'_> {
    loop {
        if word
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return SpinGuard { word };
        }
        while word.load(Ordering::Relaxed) == LOCKED {
            spin_loop();
        }
    }
}

/// RAII guard for a shared-memory spinlock.
///
/// Releases on drop, on every exit path. A guard must never outlive the
/// critical section that produced it; holding one across a blocking call
/// stalls every process hashing into the same partition.
pub(crate) struct SpinGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}
