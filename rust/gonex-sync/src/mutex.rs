//! Asynchronous mutex with FIFO waiters and timed acquisition.
//!
//! Unlike an RAII lock, this mirrors the runtime's explicit `lock`/`unlock`
//! surface: the holder releases by calling [`Mutex::unlock`], and an unlock
//! with no lock held is a contract error.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;

use gonex_core::{
    validate_timeout, GonexError, GonexResult, Timeout, DEFAULT_MUTEX_TIMEOUT,
};

use crate::waiter::next_waiter_id;

/// Options accepted by [`Mutex::with_options`].
#[derive(Debug, Clone)]
pub struct MutexOptions {
    /// Default timeout applied when `lock` is called without one.
    pub default_timeout: Timeout,
    pub name: Option<String>,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            default_timeout: Timeout::from_millis(DEFAULT_MUTEX_TIMEOUT)
                .unwrap_or(Timeout::INFINITE),
            name: None,
        }
    }
}

struct LockWaiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct State {
    locked: bool,
    waiters: VecDeque<LockWaiter>,
}

struct Shared {
    state: PlMutex<State>,
    default_timeout: Timeout,
    name: Option<String>,
}

/// A binary lock. Cloning shares the same lock.
#[derive(Clone)]
pub struct Mutex {
    shared: Arc<Shared>,
}

impl Mutex {
    pub fn new() -> Self {
        Self::with_options(MutexOptions::default())
    }

    pub fn with_options(options: MutexOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: PlMutex::new(State {
                    locked: false,
                    waiters: VecDeque::new(),
                }),
                default_timeout: options.default_timeout,
                name: options.name,
            }),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.shared.state.lock().locked
    }

    /// Acquire with the configured default timeout.
    pub async fn lock(&self) -> GonexResult<()> {
        self.lock_timeout(self.shared.default_timeout).await
    }

    /// Acquire with an explicit timeout. Waiters are served FIFO; expiry
    /// removes only this waiter.
    pub async fn lock_timeout(&self, timeout: Timeout) -> GonexResult<()> {
        validate_timeout(timeout.as_millis())?;
        let (id, rx) = {
            let mut st = self.shared.state.lock();
            if !st.locked {
                st.locked = true;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let id = next_waiter_id();
            st.waiters.push_back(LockWaiter { id, tx });
            (id, rx)
        };

        let mut wait = LockWait {
            shared: &self.shared,
            id,
            rx,
            settled: false,
        };
        let outcome = match timeout.as_duration() {
            Some(d) => match tokio::time::timeout(d, &mut wait.rx).await {
                Ok(res) => res,
                Err(_elapsed) => {
                    wait.settled = true;
                    return self.resolve_timeout(id, &mut wait.rx, timeout);
                }
            },
            None => (&mut wait.rx).await,
        };
        wait.settled = true;
        match outcome {
            Ok(()) => Ok(()),
            Err(_) => Err(GonexError::Internal {
                message: "lock waiter dropped without a grant".to_string(),
            }),
        }
    }

    /// Non-blocking acquire.
    pub fn try_lock(&self) -> bool {
        let mut st = self.shared.state.lock();
        if st.locked {
            false
        } else {
            st.locked = true;
            true
        }
    }

    /// Release the lock, handing it to the next FIFO waiter if any.
    pub fn unlock(&self) -> GonexResult<()> {
        let mut st = self.shared.state.lock();
        if !st.locked {
            return Err(GonexError::MutexNotLocked);
        }
        Self::hand_off_locked(&mut st);
        Ok(())
    }

    /// Transfer the lock to the next live waiter, or clear the flag. Caller
    /// holds the state lock and the logical mutex.
    fn hand_off_locked(st: &mut State) {
        while let Some(w) = st.waiters.pop_front() {
            if w.tx.send(()).is_ok() {
                // Lock transferred; stays held.
                return;
            }
        }
        st.locked = false;
    }

    fn resolve_timeout(
        &self,
        id: u64,
        rx: &mut oneshot::Receiver<()>,
        timeout: Timeout,
    ) -> GonexResult<()> {
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.waiters.iter().position(|w| w.id == id) {
            st.waiters.remove(pos);
            return Err(GonexError::MutexLockTimeout {
                name: self.shared.name.clone(),
                timeout_ms: timeout.as_millis(),
            });
        }
        // Granted concurrently with the expiry: we own the lock.
        match rx.try_recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(GonexError::Internal {
                message: "lock waiter vanished without a grant".to_string(),
            }),
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters a dropped lock future; a grant that raced the drop releases
/// the lock onward so it is never stranded.
struct LockWait<'a> {
    shared: &'a Shared,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for LockWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.waiters.iter().position(|w| w.id == self.id) {
            st.waiters.remove(pos);
            return;
        }
        if self.rx.try_recv().is_ok() {
            Mutex::hand_off_locked(&mut st);
        }
    }
}
