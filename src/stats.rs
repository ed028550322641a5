//! Operational statistics for the store itself.
//!
//! These are process-local metriken counters describing the store's own
//! behavior (not the shared metric data), suitable for exposition alongside
//! the rest of a host application's metrics.

use metriken::{metric, Counter};

#[metric(
    name = "shmetrics_attaches",
    description = "Total number of successful region attachments by this process"
)]
pub static ATTACHES: Counter = Counter::new();

#[metric(
    name = "shmetrics_entries_created",
    description = "Total number of metric entries created by this process"
)]
pub static ENTRIES_CREATED: Counter = Counter::new();

#[metric(
    name = "shmetrics_histogram_truncations",
    description = "Histogram observations clamped into the highest bucket"
)]
pub static HISTOGRAM_TRUNCATIONS: Counter = Counter::new();

#[metric(
    name = "shmetrics_oom_errors",
    description = "Inserts that failed because the shared arena was exhausted"
)]
pub static OOM_ERRORS: Counter = Counter::new();
