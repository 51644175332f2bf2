//! File names and tunables shared across the crate.

use std::time::Duration;

/// Config file written at the root of every index directory.
pub const CONFIG_FILE: &str = "index.config";
/// SQLite store file inside the index directory.
pub const STORAGE_FILE: &str = "storage.db";
/// Advisory lock file guarding the single writer.
pub const LOCK_FILE: &str = "writer.lock";

/// Current on-disk config format.
pub const CONFIG_FORMAT: u32 = 2;

/// Sentences per frame when the caller does not choose.
pub const DEFAULT_FRAME_SIZE: usize = 2;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub const DEFAULT_CASE_FOLD_THRESHOLD: f64 = 0.7;
pub const DEFAULT_NGRAM_MIN_COUNT: u64 = 5;
pub const DEFAULT_NGRAM_THRESHOLD: f64 = 40.0;
