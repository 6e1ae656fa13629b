// Shared constants

use std::time::Duration;

/// Default shared-memory arena size (1 GiB)
pub const DEFAULT_MAX_SHARED_MEMORY: u64 = 1024 * 1024 * 1024;

/// Padding added on top of the simulated cache high-water mark (32 MiB)
pub const CACHE_PADDING: u64 = 32 * 1024 * 1024;

/// Hard cap on the default download worker count
pub const MAX_DEFAULT_WORKERS: usize = 16;

/// Queue put/get and condition-variable wait timeout used by every
/// coordinator loop, doubling as the shutdown poll interval
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default chunk download timeout
pub const DEFAULT_DL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default progress update interval
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Processing-order optimization is disabled above this file count
pub const REORDER_FILE_LIMIT: usize = 100_000;

/// Files with fewer chunk parts than this are not considered for pairing
pub const REORDER_PART_THRESHOLD: usize = 5;

/// Minimum shared-chunk overlap for pairing; a candidate must exceed this
pub const REORDER_MIN_OVERLAP: usize = 4;
