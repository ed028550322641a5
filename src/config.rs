//! Store configuration.
//!
//! All sizing and bucketing knobs are fixed at region creation; attaching
//! processes read the authoritative values back out of the region header,
//! so a mismatched local config cannot skew bucket boundaries.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{MetricsError, MetricsResult};

/// Configuration for creating or attaching to a metric store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Path of the backing file for the shared region. A path under
    /// `/dev/shm` keeps the region memory-backed on Linux.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Virtual size of the shared region in bytes. Pages are faulted
    /// lazily, so this is a reservation, not an upfront commit. Takes
    /// effect only in the process that creates the region file; every
    /// later opener maps the existing extent.
    #[serde(default = "default_region_size")]
    pub region_size: usize,

    /// Number of lock partitions in the table. Must be a power of two.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Whether metric recording is enabled. The store itself does not
    /// gate on this; callers check [`is_enabled`](crate::MetricsStore::is_enabled).
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Histogram bucket variability. Controls bucket spacing via
    /// `gamma = (1 + variability) / (1 - variability)`. Higher values
    /// create fewer, wider buckets.
    #[serde(default = "default_bucket_variability")]
    pub bucket_variability: f64,

    /// Maximum value for histogram buckets. Observations above this are
    /// clamped into the highest bucket. The effective bound is rounded up
    /// to the nearest bucket boundary at creation.
    #[serde(default = "default_buckets_upper_bound")]
    pub buckets_upper_bound: i64,
}

fn default_path() -> PathBuf {
    PathBuf::from("/dev/shm/shmetrics.region")
}

fn default_region_size() -> usize {
    64 * 1024 * 1024
}

fn default_partitions() -> usize {
    128
}

fn default_enabled() -> bool {
    true
}

fn default_bucket_variability() -> f64 {
    0.1
}

fn default_buckets_upper_bound() -> i64 {
    30_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            region_size: default_region_size(),
            partitions: default_partitions(),
            enabled: default_enabled(),
            bucket_variability: default_bucket_variability(),
            buckets_upper_bound: default_buckets_upper_bound(),
        }
    }
}

impl StoreConfig {
    /// Minimum region size: header, partition directory, and enough heap
    /// for the initial bucket arrays.
    pub const MIN_REGION_SIZE: usize = 1024 * 1024;

    /// Validate the configuration before any shared state is touched.
    pub fn validate(&self) -> MetricsResult<()> {
        if self.partitions == 0 || !self.partitions.is_power_of_two() {
            return Err(MetricsError::InvalidConfig(
                "partitions must be a nonzero power of two",
            ));
        }
        if self.partitions > 4096 {
            return Err(MetricsError::InvalidConfig("partitions must be <= 4096"));
        }
        if self.region_size < Self::MIN_REGION_SIZE {
            return Err(MetricsError::InvalidConfig("region_size below minimum"));
        }
        if !(0.01..1.0).contains(&self.bucket_variability) {
            return Err(MetricsError::InvalidConfig(
                "bucket_variability must be in [0.01, 1.0)",
            ));
        }
        if self.buckets_upper_bound < 1 {
            return Err(MetricsError::InvalidConfig(
                "buckets_upper_bound must be >= 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.enabled);
        assert_eq!(config.partitions, 128);
        assert_eq!(config.buckets_upper_bound, 30_000);
    }

    #[test]
    fn test_rejects_non_power_of_two_partitions() {
        let config = StoreConfig {
            partitions: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MetricsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_tiny_region() {
        let config = StoreConfig {
            region_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_variability_out_of_range() {
        for v in [0.0, 0.005, 1.0, 1.5, -0.1] {
            let config = StoreConfig {
                bucket_variability: v,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "variability {v} should fail");
        }
    }

    #[test]
    fn test_deserialize_partial() {
        let config: StoreConfig =
            serde_json::from_str(r#"{ "partitions": 64, "bucket_variability": 0.05 }"#).unwrap();
        assert_eq!(config.partitions, 64);
        assert_eq!(config.bucket_variability, 0.05);
        assert_eq!(config.region_size, 64 * 1024 * 1024);
    }
}
