//! Mutex and semaphore whose state lives in shared cells.
//!
//! These are the real backing for synchronization handles passed into
//! parallel tasks: the worker-side proxy locks the same cell the main
//! thread does, so exclusion actually holds across threads. They block the
//! calling thread and must not be used from async tasks directly.

use std::time::Duration;

use gonex_core::{GonexError, GonexResult};

use crate::atomic_cell::{AtomicCell, CellMutex};

/// A cross-thread mutex over a shared cell.
pub struct SharedMutex {
    cell: CellMutex,
    name: Option<String>,
}

impl SharedMutex {
    pub fn new(name: Option<String>) -> Self {
        Self {
            cell: CellMutex::new(),
            name,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Block the calling thread until the lock is held.
    pub fn lock(&self) {
        self.cell.lock();
    }

    /// Timed acquire; `MutexLockTimeout` when the deadline passes first.
    pub fn lock_timeout(&self, timeout: Duration) -> GonexResult<()> {
        if self.cell.lock_timeout(timeout) {
            Ok(())
        } else {
            Err(GonexError::MutexLockTimeout {
                name: self.name.clone(),
                timeout_ms: timeout.as_millis() as i64,
            })
        }
    }

    /// Non-blocking acquire.
    pub fn try_lock(&self) -> bool {
        self.cell.try_lock()
    }

    /// Release. Unlocking an unheld mutex is a contract error.
    pub fn unlock(&self) -> GonexResult<()> {
        if !self.cell.is_locked() {
            return Err(GonexError::MutexNotLocked);
        }
        self.cell.unlock();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.cell.is_locked()
    }
}

/// A cross-thread counting semaphore over a shared cell.
pub struct SharedSemaphore {
    available: AtomicCell,
    permits: u32,
    name: Option<String>,
}

impl SharedSemaphore {
    pub fn new(permits: u32, name: Option<String>) -> GonexResult<Self> {
        if permits == 0 {
            return Err(GonexError::InvalidConcurrency { value: 0 });
        }
        Ok(Self {
            available: AtomicCell::new(permits),
            permits,
            name,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn permits(&self) -> u32 {
        self.permits
    }

    pub fn available(&self) -> u32 {
        self.available.load()
    }

    pub fn in_use(&self) -> u32 {
        self.permits - self.available()
    }

    /// Block the calling thread until a permit is held.
    pub fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            self.available.wait_until_changed(0, None);
        }
    }

    /// Timed acquire; `SemaphoreTimeout` when the deadline passes first.
    pub fn acquire_timeout(&self, timeout: Duration) -> GonexResult<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(GonexError::SemaphoreTimeout {
                    timeout_ms: timeout.as_millis() as i64,
                });
            }
            self.available.wait_until_changed(0, Some(deadline - now));
        }
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self) -> bool {
        loop {
            let v = self.available.load();
            if v == 0 {
                return false;
            }
            if self.available.compare_exchange(v, v - 1).is_ok() {
                return true;
            }
        }
    }

    /// Return a permit, waking one parked acquirer.
    pub fn release(&self) -> GonexResult<()> {
        loop {
            let v = self.available.load();
            if v >= self.permits {
                return Err(GonexError::Internal {
                    message: "semaphore release without a matching acquire".to_string(),
                });
            }
            if self.available.compare_exchange(v, v + 1).is_ok() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shared_mutex_excludes_across_threads() {
        let m = Arc::new(SharedMutex::new(None));
        let hits = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            let hits = hits.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    m.lock();
                    let v = hits.load(Ordering::Relaxed);
                    // Widen the race window; the lock must still serialize.
                    std::hint::spin_loop();
                    hits.store(v + 1, Ordering::Relaxed);
                    m.unlock().unwrap();
                }
            }));
        }
        for h in handles {
            h.join().ok();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn test_shared_mutex_contract() {
        let m = SharedMutex::new(Some("m".to_string()));
        assert_eq!(
            m.unlock().unwrap_err().kind(),
            gonex_core::ErrorKind::MutexNotLocked
        );
        m.lock();
        assert!(!m.try_lock());
        assert!(m
            .lock_timeout(Duration::from_millis(30))
            .unwrap_err()
            .kind()
            == gonex_core::ErrorKind::MutexLockTimeout);
        m.unlock().unwrap();
    }

    #[test]
    fn test_shared_semaphore_accounting() {
        let s = SharedSemaphore::new(2, None).unwrap();
        assert!(s.try_acquire());
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
        assert_eq!(s.available() + s.in_use(), s.permits());
        s.release().unwrap();
        assert_eq!(s.available(), 1);
        assert!(s.release().is_ok());
        assert!(s.release().is_err());
    }

    #[test]
    fn test_shared_semaphore_blocking_acquire() {
        let s = Arc::new(SharedSemaphore::new(1, None).unwrap());
        s.acquire();
        let waiter = {
            let s = s.clone();
            thread::spawn(move || s.acquire_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(30));
        s.release().unwrap();
        assert!(waiter.join().ok().map(|r| r.is_ok()).unwrap_or(false));
        assert_eq!(s.available(), 0);
    }

    #[test]
    fn test_shared_semaphore_timeout() {
        let s = SharedSemaphore::new(1, None).unwrap();
        s.acquire();
        let err = s.acquire_timeout(Duration::from_millis(30)).unwrap_err();
        assert_eq!(err.kind(), gonex_core::ErrorKind::SemaphoreTimeout);
    }
}
