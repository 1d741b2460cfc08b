pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Maximum number of write batches in flight on the write stream.
pub const MAX_PENDING_WRITES: usize = 10;

/// Default cap on concurrently active limbo resolution targets.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

pub const BATCH_ID_UNKNOWN: i32 = -1;

pub const LOG_TAG_LOCAL: &str = "firestore::local";
pub const LOG_TAG_REMOTE: &str = "firestore::remote";
pub const LOG_TAG_CORE: &str = "firestore::core";
