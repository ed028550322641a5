//! Process attachment and the metric store API.
//!
//! A [`MetricsStore`] is a per-process handle to one shared region. The
//! first process to open a region wins an initialization race and lays out
//! the header, partition directory, and bucketer parameters; every other
//! process attaches and reads the authoritative parameters back out of the
//! header. Handles are cheap `Arc` clones; dropping the last clone in a
//! process unmaps that process's view and nothing else — the backing file
//! is owned collectively and survives until an operator unlinks it.
//!
//! All recording funnels through [`increment_by`](MetricsStore::increment_by):
//! find-or-insert under the key's partition lock, mutate the value cell,
//! release. The lock is held by an RAII guard for the duration of exactly
//! one entry mutation and is released on every exit path.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use ahash::RandomState;
use tracing::{debug, warn};

use crate::bucket::HistogramBuckets;
use crate::config::StoreConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::key::{hasher_state, MetricKind, SearchKey, MAX_NAME_LEN};
use crate::labels::LabelSet;
use crate::region::{
    heap_start, SharedRegion, REGION_MAGIC, REGION_VERSION, STATE_INITIALIZING, STATE_RAW,
    STATE_READY,
};
use crate::stats;
use crate::sync;
use crate::table::{Metric, Table};

/// One process's attachment to a shared region.
struct Attachment {
    region: SharedRegion,
    hasher: RandomState,
    buckets: HistogramBuckets,
    enabled: bool,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        // Unmap only. Never unlink, never clear: the region outlives us.
        debug!(path = ?self.region.path(), "detached from metric region");
    }
}

/// Handle to a shared metric store. Clones share one attachment.
#[derive(Clone)]
pub struct MetricsStore {
    inner: Arc<Attachment>,
}

impl MetricsStore {
    /// Open a store: attach to the region at `config.path`, creating and
    /// initializing it if this is the first process to arrive.
    ///
    /// Exactly one process wins the initialization race; the rest wait for
    /// it to publish the ready state and then attach normally.
    pub fn open(config: &StoreConfig) -> MetricsResult<Self> {
        config.validate()?;
        let region = SharedRegion::create_file(&config.path, config.region_size)?;
        let header = region.header();

        match header.state.compare_exchange(
            STATE_RAW,
            STATE_INITIALIZING,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                Self::initialize_region(&region, config)?;
                header.state.store(STATE_READY, Ordering::Release);
                debug!(path = ?config.path, partitions = config.partitions, "initialized metric region");
            }
            Err(_) => Self::wait_ready(&region)?,
        }

        Self::from_ready_region(region, config.enabled)
    }

    /// Attach to an existing, initialized region. Never creates or
    /// initializes; fails `NotInitialized` until a creator has finished.
    pub fn attach(config: &StoreConfig) -> MetricsResult<Self> {
        config.validate()?;
        let region = match SharedRegion::open_file(&config.path) {
            Ok(region) => region,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MetricsError::NotInitialized);
            }
            Err(e) => return Err(e.into()),
        };
        if region.header().state.load(Ordering::Acquire) != STATE_READY {
            return Err(MetricsError::NotInitialized);
        }
        Self::from_ready_region(region, config.enabled)
    }

    /// Process-wide handle, attached lazily on first use.
    ///
    /// Subsequent calls return the cached attachment regardless of the
    /// config passed, making repeated attach calls no-ops.
    pub fn shared(config: &StoreConfig) -> MetricsResult<Self> {
        static SHARED: OnceLock<MetricsStore> = OnceLock::new();
        if let Some(store) = SHARED.get() {
            return Ok(store.clone());
        }
        let store = Self::open(config)?;
        Ok(SHARED.get_or_init(|| store).clone())
    }

    /// Remove the region's backing file. Attached processes keep their
    /// mappings; new attachments will fail. Operational teardown only.
    pub fn unlink(config: &StoreConfig) -> std::io::Result<()> {
        SharedRegion::unlink(&config.path)
    }

    fn initialize_region(region: &SharedRegion, config: &StoreConfig) -> MetricsResult<()> {
        let header = region.header();
        let buckets = HistogramBuckets::new(config.bucket_variability, config.buckets_upper_bound);

        header.magic.store(REGION_MAGIC, Ordering::Relaxed);
        header.version.store(REGION_VERSION, Ordering::Relaxed);
        // The mapped extent, not the local config: the file may predate
        // this process with a different size, and the recorded value is
        // what bounds allocation in every attacher.
        header
            .region_size
            .store(region.len() as u64, Ordering::Relaxed);
        header
            .partitions
            .store(config.partitions as u32, Ordering::Relaxed);
        header
            .initial_buckets
            .store(crate::table::INITIAL_BUCKETS as u32, Ordering::Relaxed);
        header
            .variability_bits
            .store(buckets.variability().to_bits(), Ordering::Relaxed);
        header
            .upper_bound
            .store(buckets.upper_bound(), Ordering::Relaxed);

        let heap = heap_start(config.partitions) as u64;
        header.heap_start.store(heap, Ordering::Relaxed);
        header.watermark.store(heap, Ordering::Relaxed);

        Table::initialize(region, config.partitions)
    }

    /// Wait briefly for a concurrent initializer to publish readiness.
    fn wait_ready(region: &SharedRegion) -> MetricsResult<()> {
        let header = region.header();
        for _ in 0..1_000_000 {
            if header.state.load(Ordering::Acquire) == STATE_READY {
                return Ok(());
            }
            sync::spin_loop();
        }
        // Initializer stalled or died mid-init; nothing we can safely do.
        Err(MetricsError::NotInitialized)
    }

    fn from_ready_region(region: SharedRegion, enabled: bool) -> MetricsResult<Self> {
        let header = region.header();
        if header.magic.load(Ordering::Relaxed) != REGION_MAGIC
            || header.version.load(Ordering::Relaxed) != REGION_VERSION
        {
            return Err(MetricsError::BadRegion);
        }

        let variability = f64::from_bits(header.variability_bits.load(Ordering::Relaxed));
        let upper_bound = header.upper_bound.load(Ordering::Relaxed);
        let buckets = HistogramBuckets::from_parts(variability, upper_bound);

        stats::ATTACHES.increment();
        debug!(path = ?region.path(), "attached to metric region");

        Ok(Self {
            inner: Arc::new(Attachment {
                region,
                hasher: hasher_state(),
                buckets,
                enabled,
            }),
        })
    }

    #[inline]
    fn table(&self) -> Table<'_> {
        Table::new(&self.inner.region, &self.inner.hasher)
    }

    fn ensure_ready(&self) -> MetricsResult<()> {
        let header = self.inner.region.header();
        if header.state.load(Ordering::Acquire) != STATE_READY {
            return Err(MetricsError::NotInitialized);
        }
        Ok(())
    }

    fn validate_name(name: &str) -> MetricsResult<()> {
        if name.len() >= MAX_NAME_LEN {
            return Err(MetricsError::NameTooLong);
        }
        Ok(())
    }

    /// Canonical bytes for a label set; `None` for absent or empty sets,
    /// which are the same identity.
    fn canonical(labels: Option<&LabelSet>) -> MetricsResult<Option<Vec<u8>>> {
        match labels {
            Some(set) if !set.is_empty() => Ok(Some(set.canonical_bytes()?)),
            _ => Ok(None),
        }
    }

    /// The primitive beneath every recording operation: find-or-insert,
    /// then `value += amount` under the partition lock.
    pub fn increment_by(
        &self,
        name: &str,
        labels: Option<&LabelSet>,
        kind: MetricKind,
        bucket: i64,
        amount: i64,
    ) -> MetricsResult<i64> {
        Self::validate_name(name)?;
        let bytes = Self::canonical(labels)?;
        self.increment_raw(name, bytes.as_deref(), kind, bucket, amount)
    }

    fn increment_raw(
        &self,
        name: &str,
        labels: Option<&[u8]>,
        kind: MetricKind,
        bucket: i64,
        amount: i64,
    ) -> MetricsResult<i64> {
        self.ensure_ready()?;
        let table = self.table();
        let key = SearchKey {
            name,
            labels,
            kind,
            bucket,
        };
        let (mut guard, _created) = table.find_or_insert(&key).map_err(|e| {
            if matches!(e, MetricsError::OutOfSharedMemory) {
                stats::OOM_ERRORS.increment();
            }
            e
        })?;
        Ok(guard.add(amount))
    }

    /// Increment a counter by 1, returning the new value.
    pub fn increment_counter(&self, name: &str, labels: Option<&LabelSet>) -> MetricsResult<i64> {
        self.increment_by(name, labels, MetricKind::Counter, 0, 1)
    }

    /// Increment a counter by `amount` (> 0), returning the new value.
    pub fn increment_counter_by(
        &self,
        name: &str,
        labels: Option<&LabelSet>,
        amount: i64,
    ) -> MetricsResult<i64> {
        if amount <= 0 {
            return Err(MetricsError::InvalidIncrement);
        }
        self.increment_by(name, labels, MetricKind::Counter, 0, amount)
    }

    /// Overwrite a gauge, returning the stored value.
    pub fn set_gauge(
        &self,
        name: &str,
        labels: Option<&LabelSet>,
        value: i64,
    ) -> MetricsResult<i64> {
        Self::validate_name(name)?;
        self.ensure_ready()?;
        let bytes = Self::canonical(labels)?;
        let table = self.table();
        let key = SearchKey {
            name,
            labels: bytes.as_deref(),
            kind: MetricKind::Gauge,
            bucket: 0,
        };
        let (mut guard, _created) = table.find_or_insert(&key)?;
        Ok(guard.set(value))
    }

    /// Adjust a gauge by a nonzero delta, returning the new value.
    pub fn add_to_gauge(
        &self,
        name: &str,
        labels: Option<&LabelSet>,
        delta: i64,
    ) -> MetricsResult<i64> {
        if delta == 0 {
            return Err(MetricsError::InvalidDelta);
        }
        self.increment_by(name, labels, MetricKind::Gauge, 0, delta)
    }

    /// Record a histogram observation, returning the observation count of
    /// the bucket it landed in.
    ///
    /// This is two independent table operations — bucket count, then sum —
    /// not atomic with respect to each other. A concurrent scan may see
    /// the bucket updated without the sum or vice versa; that window is a
    /// documented property, kept for compatibility with readers that
    /// already tolerate it.
    pub fn record_histogram(
        &self,
        name: &str,
        labels: Option<&LabelSet>,
        value: f64,
    ) -> MetricsResult<i64> {
        Self::validate_name(name)?;
        let bytes = Self::canonical(labels)?;

        let (boundary, truncated) = self.inner.buckets.bucket_for(value);
        if truncated {
            stats::HISTOGRAM_TRUNCATIONS.increment();
            warn!(
                value,
                upper_bound = self.inner.buckets.upper_bound(),
                "histogram data truncated"
            );
        }

        let count = self.increment_raw(
            name,
            bytes.as_deref(),
            MetricKind::HistogramBucket,
            boundary,
            1,
        )?;
        self.increment_raw(
            name,
            bytes.as_deref(),
            MetricKind::HistogramSum,
            0,
            value as i64,
        )?;
        Ok(count)
    }

    /// Copy every metric out of the store.
    ///
    /// Partitions are visited one at a time, each under its own lock, so
    /// the result is consistent within a partition but only weakly
    /// consistent across the table.
    pub fn scan(&self) -> MetricsResult<Vec<Metric>> {
        self.ensure_ready()?;
        self.table().scan()
    }

    /// All possible histogram bucket boundaries under this region's
    /// configuration, deduplicated.
    pub fn histogram_buckets(&self) -> Vec<i64> {
        self.inner.buckets.boundaries()
    }

    /// Delete every entry matching `name` and `labels` (across kinds and
    /// buckets, so a histogram's bucket and sum entries all match).
    /// Returns the count deleted.
    pub fn delete(&self, name: &str, labels: Option<&LabelSet>) -> MetricsResult<i64> {
        Self::validate_name(name)?;
        self.ensure_ready()?;
        let bytes = Self::canonical(labels)?;
        Ok(self.table().delete_matching(name, bytes.as_deref()) as i64)
    }

    /// Delete every entry in the store, returning the count deleted.
    pub fn clear(&self) -> MetricsResult<i64> {
        self.ensure_ready()?;
        Ok(self.table().clear() as i64)
    }

    /// Whether the shared region has completed initialization.
    pub fn is_ready(&self) -> bool {
        let header = self.inner.region.header();
        header.state.load(Ordering::Acquire) == STATE_READY
            && header.magic.load(Ordering::Relaxed) == REGION_MAGIC
    }

    /// Whether recording is enabled in this process's configuration.
    /// The store does not gate on this; call sites do.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Number of metric entries (racy snapshot).
    pub fn len(&self) -> u64 {
        self.table().len()
    }

    /// Whether the store holds no entries (racy snapshot).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared heap bytes currently allocated to entries and labels.
    pub fn shared_bytes_used(&self) -> u64 {
        crate::arena::Arena::new(&self.inner.region).bytes_live()
    }
}
