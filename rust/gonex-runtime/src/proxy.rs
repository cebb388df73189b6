//! Worker-side stand-ins for main-thread primitives.
//!
//! A proxy supports only the operations safely expressible across the
//! boundary. Context proxies read live cancellation state from the shared
//! context-state registry; mutex and semaphore proxies delegate to
//! shared-memory objects whose state genuinely lives in shared cells;
//! channel proxies expose the non-blocking surface only, and their try-ops
//! can never observe a main-thread rendezvous.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use gonex_core::{GonexError, GonexResult};
use gonex_shm::{SharedMutex, SharedSemaphore};

use crate::marshal::{ChannelHandle, ContextSnapshot, TaskValue};

/// Live cancellation causes keyed by context id, written by the main
/// thread and read by context proxies on workers.
pub type ContextStateRegistry = Arc<DashMap<String, GonexError>>;

/// Worker-side view of a marshaled [`gonex_sync::Context`].
pub struct ContextProxy {
    snapshot: ContextSnapshot,
    states: ContextStateRegistry,
    /// Local deadline reconstructed from the snapshot's remaining time.
    deadline: Option<Instant>,
}

impl ContextProxy {
    pub(crate) fn new(snapshot: ContextSnapshot, states: ContextStateRegistry) -> Self {
        let deadline = snapshot
            .deadline_remaining_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms.max(0) as u64));
        Self {
            snapshot,
            states,
            deadline,
        }
    }

    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    /// Cancellation cause: live registry state first, then the snapshot,
    /// then the locally tracked deadline.
    pub fn err(&self) -> Option<GonexError> {
        if let Some(e) = self.states.get(&self.snapshot.id) {
            return Some(e.clone());
        }
        if self.snapshot.error.is_some() {
            // The snapshot only records that cancellation already happened;
            // the registry carries the precise cause when available.
            return Some(GonexError::ContextCancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(GonexError::ContextDeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Snapshot value lookup; nearest binding at marshal time.
    pub fn value(&self, key: &str) -> Option<TaskValue> {
        self.snapshot.values.get(key).cloned()
    }
}

/// Worker-side view of a marshaled channel. Blocking rendezvous stays on
/// the main thread, so the try-ops here are honest about never succeeding.
pub struct ChannelProxy {
    handle: ChannelHandle,
}

impl ChannelProxy {
    pub(crate) fn new(handle: ChannelHandle) -> Self {
        Self { handle }
    }

    /// Always `None`: values never cross through a proxy.
    pub fn try_receive(&self) -> Option<TaskValue> {
        None
    }

    /// Always `false`: values never cross through a proxy.
    pub fn try_send(&self, _value: &TaskValue) -> bool {
        false
    }

    pub fn len(&self) -> usize {
        self.handle.len
    }

    pub fn is_empty(&self) -> bool {
        self.handle.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.handle.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.handle.closed
    }

    pub fn name(&self) -> Option<&str> {
        self.handle.name.as_deref()
    }

    /// Blocking receive is not expressible across the boundary.
    pub fn receive(&self) -> GonexResult<TaskValue> {
        Err(GonexError::ProxyUnsupported {
            operation: "blocking channel receive".to_string(),
        })
    }

    /// Blocking send is not expressible across the boundary.
    pub fn send(&self, _value: TaskValue) -> GonexResult<()> {
        Err(GonexError::ProxyUnsupported {
            operation: "blocking channel send".to_string(),
        })
    }
}

/// Worker-side mutex proxy delegating to shared-cell state. Exclusion
/// genuinely holds between the main thread and workers.
pub struct MutexProxy {
    inner: Arc<SharedMutex>,
}

impl MutexProxy {
    pub(crate) fn new(inner: Arc<SharedMutex>) -> Self {
        Self { inner }
    }

    pub fn lock(&self) {
        self.inner.lock();
    }

    pub fn lock_timeout(&self, timeout: Duration) -> GonexResult<()> {
        self.inner.lock_timeout(timeout)
    }

    pub fn try_lock(&self) -> bool {
        self.inner.try_lock()
    }

    pub fn unlock(&self) -> GonexResult<()> {
        self.inner.unlock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Worker-side semaphore proxy delegating to shared-cell state.
pub struct SemaphoreProxy {
    inner: Arc<SharedSemaphore>,
}

impl SemaphoreProxy {
    pub(crate) fn new(inner: Arc<SharedSemaphore>) -> Self {
        Self { inner }
    }

    pub fn acquire(&self) {
        self.inner.acquire();
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> GonexResult<()> {
        self.inner.acquire_timeout(timeout)
    }

    pub fn try_acquire(&self) -> bool {
        self.inner.try_acquire()
    }

    pub fn release(&self) -> GonexResult<()> {
        self.inner.release()
    }

    pub fn available(&self) -> u32 {
        self.inner.available()
    }
}

/// One arm of a worker-side select over channel proxies.
pub enum WorkerSelectCase<'a> {
    Receive(&'a ChannelProxy),
    Send(&'a ChannelProxy, TaskValue),
}

/// Minimal select usable on a worker: only proxy try-ops, so with no ready
/// case it can at best run `default` or wait out the timeout. The main
/// thread remains the authority for blocking rendezvous.
pub fn worker_select(
    cases: &[WorkerSelectCase<'_>],
    default: Option<Box<dyn FnOnce() + Send>>,
    timeout: Option<Duration>,
) -> Option<TaskValue> {
    let scan = |cases: &[WorkerSelectCase<'_>]| -> Option<TaskValue> {
        for case in cases {
            match case {
                WorkerSelectCase::Receive(ch) => {
                    if let Some(v) = ch.try_receive() {
                        return Some(v);
                    }
                }
                WorkerSelectCase::Send(ch, v) => {
                    if ch.try_send(v) {
                        return Some(TaskValue::Null);
                    }
                }
            }
        }
        None
    };

    if let Some(v) = scan(cases) {
        return Some(v);
    }
    if let Some(default) = default {
        default();
        return None;
    }
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        if let Some(v) = scan(cases) {
            return Some(v);
        }
        match deadline {
            Some(d) if Instant::now() >= d => return None,
            // No timeout and nothing ready: proxies cannot become ready, so
            // waiting forever would hang the worker.
            None => return None,
            _ => std::thread::sleep(Duration::from_millis(5)),
        }
    }
}
