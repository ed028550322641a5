//! Metric identity: kind, label reference, and the composite search key.
//!
//! A metric is identified by (name, labels, kind, bucket). The labels half
//! of the identity has two storage forms: a *local* reference to canonical
//! bytes in the caller's address space (search keys only, never stored) and
//! a *shared* reference, an arena offset, which is the only form a stored
//! entry ever carries. Hashing and equality route through the canonical
//! bytes regardless of form, so a local search key finds its shared entry.

use std::hash::{BuildHasher, Hasher};

use ahash::RandomState;

/// Maximum bytes in a metric name cell (NUL-free, so names are <= 63 bytes).
pub const MAX_NAME_LEN: usize = 64;

/// The kind of a metric entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MetricKind {
    /// Monotonically increasing counter.
    Counter = 0,
    /// Gauge, set or adjusted to arbitrary values.
    Gauge = 1,
    /// One bucket of a histogram; the key's `bucket` field holds the
    /// bucket's upper-bound value.
    HistogramBucket = 2,
    /// Running sum of all observations recorded to a histogram.
    HistogramSum = 3,
}

impl MetricKind {
    /// Wire name used in scan output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::HistogramBucket => "histogram",
            Self::HistogramSum => "histogram_sum",
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Counter),
            1 => Some(Self::Gauge),
            2 => Some(Self::HistogramBucket),
            3 => Some(Self::HistogramSum),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A search key: the local-form composite identity used to probe the table.
///
/// Holds borrowed canonical label bytes (or none). Search keys are built
/// per call and never stored; the table's insert path copies the key and
/// promotes the labels into the shared arena.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchKey<'a> {
    pub name: &'a str,
    /// Canonical label bytes, `None` for absent or empty label sets.
    pub labels: Option<&'a [u8]>,
    pub kind: MetricKind,
    pub bucket: i64,
}

/// Fixed hasher seeds: every process attached to the same region must
/// compute identical hashes for identical keys, so the usual per-process
/// random seeding is off the table.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x9ae16a3b2f90404f,
    0xc3a5c85c97cb3127,
    0xb492b66fbe98f273,
    0x165667b19e3779f9,
);

/// Build the shared, deterministic hasher state.
pub(crate) fn hasher_state() -> RandomState {
    RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3)
}

/// Hash a composite key from its parts.
///
/// Every caller, whether hashing a local search key or a stored entry,
/// must pass the labels as canonical bytes (empty slice for absent), so
/// logically equal keys hash identically regardless of storage form.
pub(crate) fn hash_parts(
    state: &RandomState,
    name: &[u8],
    kind: MetricKind,
    bucket: i64,
    labels: &[u8],
) -> u64 {
    let mut hasher = state.build_hasher();
    hasher.write(name);
    hasher.write_u32(kind as u32);
    hasher.write_i64(bucket);
    hasher.write(labels);
    hasher.finish()
}

impl<'a> SearchKey<'a> {
    pub fn hash(&self, state: &RandomState) -> u64 {
        hash_parts(
            state,
            self.name.as_bytes(),
            self.kind,
            self.bucket,
            self.labels.unwrap_or(&[]),
        )
    }
}
