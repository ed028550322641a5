//! Error types for metric store operations.

use std::fmt;
use std::io;

/// Errors that can occur while attaching to or operating on the store.
#[derive(Debug)]
pub enum MetricsError {
    /// Metric name exceeds the fixed key cell (max 63 bytes).
    NameTooLong,

    /// Counter increments must be greater than zero.
    InvalidIncrement,

    /// Gauge deltas must be nonzero.
    InvalidDelta,

    /// Labels could not be encoded to (or decoded from) canonical bytes.
    InvalidLabels,

    /// The shared region exists but has not completed initialization,
    /// or this process has not attached yet.
    NotInitialized,

    /// The mapped file does not carry a valid region header
    /// (wrong magic, wrong version, or truncated).
    BadRegion,

    /// The arena cannot satisfy an allocation. Existing entries are
    /// unaffected; only the insert that needed the space fails.
    OutOfSharedMemory,

    /// A stored entry failed to decode during a scan (bad kind tag or
    /// undecodable label bytes). Indicates region corruption.
    Corrupted,

    /// Configuration rejected before any shared state was touched.
    InvalidConfig(&'static str),

    /// Underlying file or mapping operation failed.
    Io(io::Error),
}

impl fmt::Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameTooLong => write!(f, "metric name too long (max 63 bytes)"),
            Self::InvalidIncrement => write!(f, "increment must be greater than 0"),
            Self::InvalidDelta => write!(f, "delta can't be 0"),
            Self::InvalidLabels => write!(f, "labels are not a valid canonical encoding"),
            Self::NotInitialized => write!(f, "metric store not initialized"),
            Self::BadRegion => write!(f, "shared region header is invalid"),
            Self::OutOfSharedMemory => write!(f, "out of shared memory"),
            Self::Corrupted => write!(f, "shared region data corrupted"),
            Self::InvalidConfig(what) => write!(f, "invalid configuration: {what}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for MetricsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MetricsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for store operations.
pub type MetricsResult<T> = Result<T, MetricsError>;
