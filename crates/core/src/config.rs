//! Store configuration
//!
//! Everything the hosting runtime hands the store at open time: file
//! locations, capacity limits, and the startup retry knobs. Changed values
//! take effect on the next open, not retroactively.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Conventional name of the permanent object store
pub const PERMANENT_STORE: &str = "permanent";

/// Conventional name of the temporary object store
pub const TEMPORARY_STORE: &str = "temporary";

/// Capacity bounds for one file category (log or a store)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBounds {
    /// Bytes reserved up front (advisory)
    pub minimum: u64,
    /// Hard cap in bytes; a write past this is refused
    pub maximum: u64,
}

impl SizeBounds {
    /// Bounds with only a hard cap
    pub fn capped(maximum: u64) -> Self {
        SizeBounds {
            minimum: 0,
            maximum,
        }
    }
}

/// Configuration consumed by the object manager and message store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the log file
    pub log_directory: PathBuf,
    /// Log file name within `log_directory`
    pub log_file_name: String,
    /// Directory holding store snapshot files
    pub store_directory: PathBuf,
    /// File prefix for the permanent store
    pub permanent_store_prefix: String,
    /// File prefix for the temporary store
    pub temporary_store_prefix: String,
    /// Capacity bounds for the log file
    pub log_size: SizeBounds,
    /// Capacity bounds for the permanent store
    pub permanent_store_size: SizeBounds,
    /// Capacity bounds for the temporary store
    pub temporary_store_size: SizeBounds,
    /// Sleep between startup attempts against an unavailable log location
    pub startup_retry_interval: Duration,
    /// Startup attempts before giving up
    pub startup_retry_attempts: u32,
}

impl StoreConfig {
    /// Config rooted at `base`, with generous default capacities
    pub fn rooted_at<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        StoreConfig {
            log_directory: base.join("log"),
            log_file_name: "store.log".to_string(),
            store_directory: base.join("stores"),
            permanent_store_prefix: "perm".to_string(),
            temporary_store_prefix: "temp".to_string(),
            log_size: SizeBounds::capped(64 * 1024 * 1024),
            permanent_store_size: SizeBounds::capped(256 * 1024 * 1024),
            temporary_store_size: SizeBounds::capped(256 * 1024 * 1024),
            startup_retry_interval: Duration::from_secs(2),
            startup_retry_attempts: 15,
        }
    }

    /// Config for tests: short retry tick, small caps
    pub fn for_testing<P: AsRef<Path>>(base: P) -> Self {
        StoreConfig {
            startup_retry_interval: Duration::from_millis(50),
            startup_retry_attempts: 5,
            ..Self::rooted_at(base)
        }
    }

    /// Set the log capacity cap
    pub fn with_log_maximum(mut self, maximum: u64) -> Self {
        self.log_size.maximum = maximum;
        self
    }

    /// Set the permanent store capacity cap
    pub fn with_permanent_maximum(mut self, maximum: u64) -> Self {
        self.permanent_store_size.maximum = maximum;
        self
    }

    /// Set the temporary store capacity cap
    pub fn with_temporary_maximum(mut self, maximum: u64) -> Self {
        self.temporary_store_size.maximum = maximum;
        self
    }

    /// Set the startup retry interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.startup_retry_interval = interval;
        self
    }

    /// Set the startup attempt cap
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.startup_retry_attempts = attempts;
        self
    }

    /// Full path of the log file
    pub fn log_path(&self) -> PathBuf {
        self.log_directory.join(&self.log_file_name)
    }

    /// Full path of the permanent store snapshot file
    pub fn permanent_store_path(&self) -> PathBuf {
        self.store_directory
            .join(format!("{}.store", self.permanent_store_prefix))
    }

    /// Full path of the temporary store snapshot file
    pub fn temporary_store_path(&self) -> PathBuf {
        self.store_directory
            .join(format!("{}.store", self.temporary_store_prefix))
    }
}
