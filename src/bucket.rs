//! Exponential histogram bucketing.
//!
//! Buckets are spaced geometrically: `gamma = (1 + variability) / (1 - variability)`
//! and the bucket for a value is `gamma^ceil(ln(value) / ln(gamma))`, truncated
//! to an integer. Bucket width grows with magnitude, so relative error stays
//! bounded by roughly `variability` across the whole range, and finding a
//! bucket is O(1) arithmetic, no search.
//!
//! A bucket is identified by its upper-bound value, not by an index. The
//! boundary value itself is what goes into the metric key's `bucket` field.

/// Histogram bucket computer, derived from two parameters fixed at region
/// creation and shared by every attached process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBuckets {
    variability: f64,
    gamma: f64,
    log_gamma: f64,
    upper_bound: i64,
}

impl HistogramBuckets {
    /// Build a bucketer, rounding `upper_bound` up to the nearest bucket
    /// boundary so the bound is itself a valid bucket value.
    pub fn new(variability: f64, upper_bound: i64) -> Self {
        let gamma = (1.0 + variability) / (1.0 - variability);
        let log_gamma = gamma.ln();

        let max_exp = ((upper_bound as f64).ln() / log_gamma).ceil() as i32;
        let rounded = gamma.powi(max_exp) as i64;

        Self {
            variability,
            gamma,
            log_gamma,
            upper_bound: rounded,
        }
    }

    /// Rebuild from parameters stored in a region header. The upper bound
    /// was already rounded by the creating process; don't round again.
    pub(crate) fn from_parts(variability: f64, upper_bound: i64) -> Self {
        let gamma = (1.0 + variability) / (1.0 - variability);
        Self {
            variability,
            gamma,
            log_gamma: gamma.ln(),
            upper_bound,
        }
    }

    /// The configured variability.
    pub fn variability(&self) -> f64 {
        self.variability
    }

    /// The effective (rounded) upper bound.
    pub fn upper_bound(&self) -> i64 {
        self.upper_bound
    }

    /// Map an observation to its bucket boundary.
    ///
    /// Returns `(boundary, truncated)`. `truncated` is set when the value
    /// exceeded the upper bound and was clamped into the highest bucket;
    /// that is a notice-worthy condition, not an error.
    pub fn bucket_for(&self, value: f64) -> (i64, bool) {
        let exp = if value < 1.0 {
            0
        } else {
            (value.ln() / self.log_gamma).ceil().max(0.0) as i32
        };

        let boundary = self.gamma.powi(exp) as i64;

        if boundary > self.upper_bound {
            (self.upper_bound, true)
        } else {
            (boundary, false)
        }
    }

    /// Enumerate every possible bucket boundary, deduplicated.
    ///
    /// The first densely-packed exponents all truncate to the same small
    /// integers, so consecutive duplicates are dropped.
    pub fn boundaries(&self) -> Vec<i64> {
        let max_exp = ((self.upper_bound as f64).ln() / self.log_gamma).ceil() as i32;

        let mut buckets = vec![0];
        let mut last = 0;
        for i in 1..=max_exp {
            let boundary = self.gamma.powi(i) as i64;
            if boundary != last {
                buckets.push(boundary);
                last = boundary;
            }
        }
        buckets
    }
}
