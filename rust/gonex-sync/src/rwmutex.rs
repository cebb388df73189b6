//! Reader-writer lock with writer preference.
//!
//! While any writer is waiting, new readers queue behind it even though no
//! writer holds the lock yet; that keeps writers from starving under heavy
//! read load. On writer release all queued readers are admitted first as a
//! batch, then a single writer if no readers were waiting.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;

use gonex_core::{validate_timeout, GonexError, GonexResult, Timeout, DEFAULT_MUTEX_TIMEOUT};

use crate::waiter::next_waiter_id;

/// Options accepted by [`RWMutex::with_options`].
#[derive(Debug, Clone)]
pub struct RWMutexOptions {
    pub default_timeout: Timeout,
    /// Cap on concurrently held read locks.
    pub max_readers: usize,
    pub name: Option<String>,
}

impl Default for RWMutexOptions {
    fn default() -> Self {
        Self {
            default_timeout: Timeout::from_millis(DEFAULT_MUTEX_TIMEOUT)
                .unwrap_or(Timeout::INFINITE),
            max_readers: 1024,
            name: None,
        }
    }
}

/// Snapshot of the lock's state, for diagnostics and proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RWMutexState {
    pub readers: usize,
    pub writer_locked: bool,
    pub writer_waiting: bool,
    pub queued_readers: usize,
    pub queued_writers: usize,
    pub max_readers: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct State {
    readers: usize,
    writer: bool,
    reader_waiters: VecDeque<Waiter>,
    writer_waiters: VecDeque<Waiter>,
}

struct Shared {
    state: PlMutex<State>,
    default_timeout: Timeout,
    max_readers: usize,
    name: Option<String>,
}

/// A multiple-reader single-writer lock. Cloning shares the same lock.
#[derive(Clone)]
pub struct RWMutex {
    shared: Arc<Shared>,
}

enum Queue {
    Reader,
    Writer,
}

impl RWMutex {
    pub fn new() -> Self {
        Self::with_options(RWMutexOptions::default())
    }

    pub fn with_options(options: RWMutexOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: PlMutex::new(State {
                    readers: 0,
                    writer: false,
                    reader_waiters: VecDeque::new(),
                    writer_waiters: VecDeque::new(),
                }),
                default_timeout: options.default_timeout,
                max_readers: options.max_readers.max(1),
                name: options.name,
            }),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    pub fn max_readers(&self) -> usize {
        self.shared.max_readers
    }

    pub fn is_read_locked(&self) -> bool {
        self.shared.state.lock().readers > 0
    }

    pub fn is_write_locked(&self) -> bool {
        self.shared.state.lock().writer
    }

    pub fn is_locked(&self) -> bool {
        let st = self.shared.state.lock();
        st.writer || st.readers > 0
    }

    pub fn state(&self) -> RWMutexState {
        let st = self.shared.state.lock();
        RWMutexState {
            readers: st.readers,
            writer_locked: st.writer,
            writer_waiting: !st.writer_waiters.is_empty(),
            queued_readers: st.reader_waiters.len(),
            queued_writers: st.writer_waiters.len(),
            max_readers: self.shared.max_readers,
        }
    }

    /// Acquire a read lock with the default timeout.
    pub async fn r_lock(&self) -> GonexResult<()> {
        self.r_lock_timeout(self.shared.default_timeout).await
    }

    /// Acquire a read lock. Blocks while a writer holds the lock, a writer
    /// is waiting, or the reader cap is reached.
    pub async fn r_lock_timeout(&self, timeout: Timeout) -> GonexResult<()> {
        validate_timeout(timeout.as_millis())?;
        let (id, rx) = {
            let mut st = self.shared.state.lock();
            if Self::can_read(&st, self.shared.max_readers) {
                st.readers += 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let id = next_waiter_id();
            st.reader_waiters.push_back(Waiter { id, tx });
            (id, rx)
        };
        self.await_grant(Queue::Reader, id, rx, timeout).await
    }

    /// Non-blocking read acquire. Fails with `RWMutexTooManyReaders` at the
    /// reader cap, `Ok(false)` when a writer holds or waits.
    pub fn try_r_lock(&self) -> GonexResult<bool> {
        let mut st = self.shared.state.lock();
        if st.readers >= self.shared.max_readers {
            return Err(GonexError::RWMutexTooManyReaders {
                max_readers: self.shared.max_readers,
            });
        }
        if st.writer || !st.writer_waiters.is_empty() {
            return Ok(false);
        }
        st.readers += 1;
        Ok(true)
    }

    /// Release a read lock. The last reader out wakes one queued writer.
    pub fn r_unlock(&self) -> GonexResult<()> {
        let mut st = self.shared.state.lock();
        if st.readers == 0 {
            return Err(GonexError::RWMutexNotReadLocked);
        }
        st.readers -= 1;
        if st.readers == 0 {
            Self::wake_writer_locked(&mut st);
        }
        Ok(())
    }

    /// Acquire the write lock with the default timeout.
    pub async fn lock(&self) -> GonexResult<()> {
        self.lock_timeout(self.shared.default_timeout).await
    }

    /// Acquire the write lock: excludes all readers and other writers.
    pub async fn lock_timeout(&self, timeout: Timeout) -> GonexResult<()> {
        validate_timeout(timeout.as_millis())?;
        let (id, rx) = {
            let mut st = self.shared.state.lock();
            if st.readers == 0 && !st.writer {
                st.writer = true;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let id = next_waiter_id();
            st.writer_waiters.push_back(Waiter { id, tx });
            (id, rx)
        };
        self.await_grant(Queue::Writer, id, rx, timeout).await
    }

    /// Non-blocking write acquire.
    pub fn try_lock(&self) -> bool {
        let mut st = self.shared.state.lock();
        if st.readers == 0 && !st.writer {
            st.writer = true;
            true
        } else {
            false
        }
    }

    /// Release the write lock. All queued readers are admitted first as a
    /// batch; a single writer is woken only if no readers were waiting.
    pub fn unlock(&self) -> GonexResult<()> {
        let mut st = self.shared.state.lock();
        if !st.writer {
            return Err(GonexError::RWMutexNotWriteLocked);
        }
        st.writer = false;
        let admitted = Self::wake_readers_locked(&mut st, self.shared.max_readers);
        if admitted == 0 {
            Self::wake_writer_locked(&mut st);
        }
        Ok(())
    }

    fn can_read(st: &State, max_readers: usize) -> bool {
        !st.writer && st.writer_waiters.is_empty() && st.readers < max_readers
    }

    /// Admit queued readers up to the cap. Caller holds the state lock and
    /// has already cleared the writer flag.
    fn wake_readers_locked(st: &mut State, max_readers: usize) -> usize {
        let mut admitted = 0;
        while st.readers < max_readers {
            let Some(w) = st.reader_waiters.pop_front() else { break };
            if w.tx.send(()).is_ok() {
                st.readers += 1;
                admitted += 1;
            }
        }
        admitted
    }

    fn wake_writer_locked(st: &mut State) {
        if st.writer || st.readers > 0 {
            return;
        }
        while let Some(w) = st.writer_waiters.pop_front() {
            if w.tx.send(()).is_ok() {
                st.writer = true;
                return;
            }
        }
    }

    async fn await_grant(
        &self,
        queue: Queue,
        id: u64,
        rx: oneshot::Receiver<()>,
        timeout: Timeout,
    ) -> GonexResult<()> {
        let mut wait = GrantWait {
            shared: &self.shared,
            queue,
            id,
            rx,
            settled: false,
        };
        let outcome = match timeout.as_duration() {
            Some(d) => match tokio::time::timeout(d, &mut wait.rx).await {
                Ok(res) => res,
                Err(_elapsed) => {
                    wait.settled = true;
                    return self.resolve_timeout(&wait.queue, id, &mut wait.rx, timeout);
                }
            },
            None => (&mut wait.rx).await,
        };
        wait.settled = true;
        match outcome {
            Ok(()) => Ok(()),
            Err(_) => Err(GonexError::Internal {
                message: "rwmutex waiter dropped without a grant".to_string(),
            }),
        }
    }

    fn resolve_timeout(
        &self,
        queue: &Queue,
        id: u64,
        rx: &mut oneshot::Receiver<()>,
        timeout: Timeout,
    ) -> GonexResult<()> {
        let mut st = self.shared.state.lock();
        let waiters = match queue {
            Queue::Reader => &mut st.reader_waiters,
            Queue::Writer => &mut st.writer_waiters,
        };
        if let Some(pos) = waiters.iter().position(|w| w.id == id) {
            waiters.remove(pos);
            return Err(match queue {
                Queue::Reader => GonexError::RWMutexReadLockTimeout {
                    timeout_ms: timeout.as_millis(),
                },
                Queue::Writer => GonexError::RWMutexWriteLockTimeout {
                    timeout_ms: timeout.as_millis(),
                },
            });
        }
        match rx.try_recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(GonexError::Internal {
                message: "rwmutex waiter vanished without a grant".to_string(),
            }),
        }
    }
}

impl Default for RWMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters a dropped acquire future; a grant that raced the drop is
/// released back so the lock is never stranded.
struct GrantWait<'a> {
    shared: &'a Shared,
    queue: Queue,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for GrantWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut st = self.shared.state.lock();
        let waiters = match self.queue {
            Queue::Reader => &mut st.reader_waiters,
            Queue::Writer => &mut st.writer_waiters,
        };
        if let Some(pos) = waiters.iter().position(|w| w.id == self.id) {
            waiters.remove(pos);
            return;
        }
        if self.rx.try_recv().is_ok() {
            match self.queue {
                Queue::Reader => {
                    st.readers = st.readers.saturating_sub(1);
                    if st.readers == 0 {
                        RWMutex::wake_writer_locked(&mut st);
                    }
                }
                Queue::Writer => {
                    st.writer = false;
                    // Mirror the release path: readers first, then a writer.
                    let admitted =
                        RWMutex::wake_readers_locked(&mut st, self.shared.max_readers);
                    if admitted == 0 {
                        RWMutex::wake_writer_locked(&mut st);
                    }
                }
            }
        }
    }
}
