//! Waiter bookkeeping shared by the primitives.
//!
//! Each blocked operation registers a FIFO queue entry holding a oneshot
//! sender; the grant side completes the oneshot while holding the
//! primitive's state lock. Cancellation (timeout or a dropped future)
//! removes the entry under the same lock, so a grant and a cancellation
//! can never both win.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a queued waiter.
pub(crate) fn next_waiter_id() -> u64 {
    NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed)
}
