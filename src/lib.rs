//! A shared-memory metric store for cooperating processes.
//!
//! Any number of processes attach to one file-backed shared region and
//! record counters, gauges, and exponential histograms against dynamic
//! (name, labels) keys. Metrics created by one process are immediately
//! visible to, and updatable by, every other attached process; a process
//! crashing or restarting loses nothing, because all metric state lives in
//! the region, not in any process.
//!
//! ```no_run
//! use shmetrics::{LabelSet, MetricsStore, StoreConfig};
//!
//! let store = MetricsStore::open(&StoreConfig::default())?;
//!
//! let mut labels = LabelSet::new();
//! labels.insert("endpoint", "/search");
//!
//! store.increment_counter("http_requests", Some(&labels))?;
//! store.set_gauge("active_connections", None, 42)?;
//! store.record_histogram("request_ms", Some(&labels), 17.0)?;
//!
//! for metric in store.scan()? {
//!     println!("{} {} = {}", metric.kind, metric.name, metric.value);
//! }
//! # Ok::<(), shmetrics::MetricsError>(())
//! ```
//!
//! # Architecture
//!
//! The region is a single file mapped `MAP_SHARED` by every participant.
//! Inside it live an offset-addressed arena allocator and a partitioned
//! chained hash table; a key's hash picks both its lock partition and its
//! bucket, so writers to different keys almost never contend. Histograms
//! are flat entries in the same table: one entry per observed bucket
//! boundary plus a running sum.
//!
//! Everything in the region is offsets, atomics, and spinlocks — no
//! pointers, no process-local lock state — which is what makes the region
//! simultaneously mappable at different addresses in unrelated processes.

mod arena;
mod bucket;
mod config;
mod error;
mod key;
mod labels;
mod region;
mod stats;
mod store;
mod sync;
mod table;

pub use bucket::HistogramBuckets;
pub use config::StoreConfig;
pub use error::{MetricsError, MetricsResult};
pub use key::{MetricKind, MAX_NAME_LEN};
pub use labels::LabelSet;
pub use store::MetricsStore;
pub use table::Metric;
