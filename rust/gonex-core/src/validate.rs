//! Boundary validation, raised before any side effect.

use crate::constants::{INFINITE_TIMEOUT, MAX_CHANNEL_BUFFER, MAX_TIMEOUT, MAX_WORKER_POOL_SIZE};
use crate::error::{GonexError, GonexResult};

/// A timeout is valid if it is the infinite sentinel or within
/// `[0, MAX_TIMEOUT]` milliseconds.
pub fn validate_timeout(ms: i64) -> GonexResult<()> {
    if ms == INFINITE_TIMEOUT || (0..=MAX_TIMEOUT).contains(&ms) {
        Ok(())
    } else {
        Err(GonexError::InvalidTimeout { value: ms })
    }
}

/// A channel buffer capacity is valid within `[0, MAX_CHANNEL_BUFFER]`.
pub fn validate_buffer_size(capacity: i64) -> GonexResult<()> {
    if (0..=MAX_CHANNEL_BUFFER as i64).contains(&capacity) {
        Ok(())
    } else {
        Err(GonexError::InvalidBufferSize { value: capacity })
    }
}

/// A concurrency level (thread count, pool size, segment count) is valid
/// within `[1, MAX_WORKER_POOL_SIZE]`.
pub fn validate_concurrency(level: i64) -> GonexResult<()> {
    if (1..=MAX_WORKER_POOL_SIZE as i64).contains(&level) {
        Ok(())
    } else {
        Err(GonexError::InvalidConcurrency { value: level })
    }
}

/// A semaphore permit count must be at least 1.
pub fn validate_permits(permits: i64) -> GonexResult<()> {
    if permits >= 1 {
        Ok(())
    } else {
        Err(GonexError::InvalidConcurrency { value: permits })
    }
}
