//! Millisecond timeout type with the `-1` infinite sentinel.

use std::time::{Duration, Instant};

use crate::constants::{INFINITE_TIMEOUT, MAX_TIMEOUT};
use crate::error::{GonexError, GonexResult};

/// A validated timeout in milliseconds.
///
/// `Timeout::INFINITE` (the `-1` sentinel) disables the deadline; any finite
/// value is bounded by [`MAX_TIMEOUT`]. Timeouts are always measured from
/// call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(i64);

impl Timeout {
    /// No deadline.
    pub const INFINITE: Timeout = Timeout(INFINITE_TIMEOUT);

    /// Validate and construct from raw milliseconds.
    pub fn from_millis(ms: i64) -> GonexResult<Self> {
        if ms == INFINITE_TIMEOUT || (0..=MAX_TIMEOUT).contains(&ms) {
            Ok(Timeout(ms))
        } else {
            Err(GonexError::InvalidTimeout { value: ms })
        }
    }

    /// Raw millisecond value, `-1` for infinite.
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == INFINITE_TIMEOUT
    }

    /// Finite timeouts as a `Duration`, `None` when infinite.
    pub fn as_duration(&self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::from_millis(self.0 as u64))
        }
    }

    /// Deadline measured from now, `None` when infinite.
    pub fn deadline(&self) -> Option<Instant> {
        self.as_duration().map(|d| Instant::now() + d)
    }

    /// The more restrictive of two timeouts.
    pub fn min(self, other: Timeout) -> Timeout {
        match (self.is_infinite(), other.is_infinite()) {
            (true, _) => other,
            (_, true) => self,
            _ => Timeout(self.0.min(other.0)),
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::INFINITE
    }
}
