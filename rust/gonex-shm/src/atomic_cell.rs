//! Lock and condition protocols over shared integer cells.
//!
//! An [`AtomicCell`] is a `u32` shared between threads with compare-and-swap,
//! ordered load/store, and park-until-changed / unpark. A [`CellMutex`] is
//! the two-state lock protocol over a cell: spin briefly, then park.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex as PlMutex};

/// Cell value for an unlocked [`CellMutex`].
pub const UNLOCKED: u32 = 0;
/// Cell value for a locked [`CellMutex`].
pub const LOCKED: u32 = 1;

const SPIN_LIMIT: u32 = 64;

/// A shared integer cell with waiting.
///
/// Waiters hold the internal mutex from the value check through the park,
/// and mutators touch the same mutex before notifying, so a change between
/// check and park cannot be missed.
pub struct AtomicCell {
    value: AtomicU32,
    park: PlMutex<()>,
    cond: Condvar,
}

impl AtomicCell {
    pub fn new(initial: u32) -> Self {
        Self {
            value: AtomicU32::new(initial),
            park: PlMutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn load(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Store and wake every parked waiter.
    pub fn store(&self, v: u32) {
        self.value.store(v, Ordering::SeqCst);
        self.wake_all();
    }

    /// Compare-and-swap; wakes waiters on success. Returns the previous
    /// value either way.
    pub fn compare_exchange(&self, current: u32, new: u32) -> Result<u32, u32> {
        let r = self
            .value
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst);
        if r.is_ok() {
            self.wake_all();
        }
        r
    }

    /// Add and wake; returns the previous value.
    pub fn fetch_add(&self, delta: u32) -> u32 {
        let prev = self.value.fetch_add(delta, Ordering::SeqCst);
        self.wake_all();
        prev
    }

    /// Subtract and wake; returns the previous value.
    pub fn fetch_sub(&self, delta: u32) -> u32 {
        let prev = self.value.fetch_sub(delta, Ordering::SeqCst);
        self.wake_all();
        prev
    }

    /// Park until the value differs from `old` or the timeout elapses.
    /// Returns the changed value, or `None` on timeout.
    pub fn wait_until_changed(&self, old: u32, timeout: Option<Duration>) -> Option<u32> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = self.park.lock();
        loop {
            let cur = self.value.load(Ordering::SeqCst);
            if cur != old {
                return Some(cur);
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return None;
                    }
                    if self.cond.wait_for(&mut guard, d - now).timed_out() {
                        let cur = self.value.load(Ordering::SeqCst);
                        return if cur != old { Some(cur) } else { None };
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }
    }

    /// Wake one parked waiter.
    pub fn notify_one(&self) {
        let _g = self.park.lock();
        drop(_g);
        self.cond.notify_one();
    }

    /// Wake every parked waiter.
    pub fn notify_all(&self) {
        self.wake_all();
    }

    fn wake_all(&self) {
        let _g = self.park.lock();
        drop(_g);
        self.cond.notify_all();
    }
}

/// The mutex protocol over a cell: `UNLOCKED(0) | LOCKED(1)`. Acquire spins
/// briefly then parks; release stores `UNLOCKED` and wakes.
pub struct CellMutex {
    cell: AtomicCell,
}

impl CellMutex {
    pub fn new() -> Self {
        Self {
            cell: AtomicCell::new(UNLOCKED),
        }
    }

    /// Block the calling thread until the lock is held.
    pub fn lock(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.try_lock() {
                return;
            }
            std::hint::spin_loop();
        }
        loop {
            if self.try_lock() {
                return;
            }
            self.cell.wait_until_changed(LOCKED, None);
        }
    }

    /// Timed acquire; `false` when the deadline passes first.
    pub fn lock_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for _ in 0..SPIN_LIMIT {
            if self.try_lock() {
                return true;
            }
            std::hint::spin_loop();
        }
        loop {
            if self.try_lock() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cell.wait_until_changed(LOCKED, Some(deadline - now));
        }
    }

    pub fn try_lock(&self) -> bool {
        self.cell.compare_exchange(UNLOCKED, LOCKED).is_ok()
    }

    pub fn unlock(&self) {
        self.cell.store(UNLOCKED);
    }

    pub fn is_locked(&self) -> bool {
        self.cell.load() == LOCKED
    }

    /// Run `f` under the lock.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}

impl Default for CellMutex {
    fn default() -> Self {
        Self::new()
    }
}
