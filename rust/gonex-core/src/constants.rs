//! Runtime-wide constants and default timeouts.

/// Sentinel disabling a deadline. Accepted anywhere a timeout is.
pub const INFINITE_TIMEOUT: i64 = -1;

/// Upper bound on any finite timeout: 24 hours in milliseconds.
pub const MAX_TIMEOUT: i64 = 86_400_000;

/// Largest permitted channel buffer capacity.
pub const MAX_CHANNEL_BUFFER: usize = 1_000_000;

/// Largest permitted worker pool size.
pub const MAX_WORKER_POOL_SIZE: usize = 10_000;

/// Default timeout for general operations (ms).
pub const DEFAULT_TIMEOUT: i64 = 5_000;

/// Default timeout for channel send/receive (ms).
pub const DEFAULT_CHANNEL_TIMEOUT: i64 = 1_000;

/// Default timeout for mutex acquisition (ms).
pub const DEFAULT_MUTEX_TIMEOUT: i64 = 3_000;

/// Default timeout for semaphore acquisition (ms).
pub const DEFAULT_SEMAPHORE_TIMEOUT: i64 = 2_000;
