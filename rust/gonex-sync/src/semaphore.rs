//! Counting semaphore with FIFO permit grants.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;

use gonex_core::{
    validate_permits, validate_timeout, GonexError, GonexResult, Timeout,
    DEFAULT_SEMAPHORE_TIMEOUT,
};

use crate::waiter::next_waiter_id;

/// Options accepted by [`Semaphore::with_options`].
#[derive(Debug, Clone)]
pub struct SemaphoreOptions {
    /// Total number of permits.
    pub permits: usize,
    pub default_timeout: Timeout,
    pub name: Option<String>,
}

impl Default for SemaphoreOptions {
    fn default() -> Self {
        Self {
            permits: 1,
            default_timeout: Timeout::from_millis(DEFAULT_SEMAPHORE_TIMEOUT)
                .unwrap_or(Timeout::INFINITE),
            name: None,
        }
    }
}

struct PermitWaiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct State {
    available: usize,
    waiters: VecDeque<PermitWaiter>,
}

struct Shared {
    state: PlMutex<State>,
    permits: usize,
    default_timeout: Timeout,
    #[allow(dead_code)]
    name: Option<String>,
}

/// A counting semaphore. Cloning shares the same permit pool.
#[derive(Clone)]
pub struct Semaphore {
    shared: Arc<Shared>,
}

impl Semaphore {
    /// A semaphore with `permits` total permits, all initially available.
    pub fn new(permits: usize) -> GonexResult<Self> {
        Self::with_options(SemaphoreOptions {
            permits,
            ..SemaphoreOptions::default()
        })
    }

    pub fn with_options(options: SemaphoreOptions) -> GonexResult<Self> {
        validate_permits(options.permits as i64)?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: PlMutex::new(State {
                    available: options.permits,
                    waiters: VecDeque::new(),
                }),
                permits: options.permits,
                default_timeout: options.default_timeout,
                name: options.name,
            }),
        })
    }

    /// Total permit count.
    pub fn permits(&self) -> usize {
        self.shared.permits
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.shared.state.lock().available
    }

    /// Permits currently held; `available + in_use == permits` always.
    pub fn in_use(&self) -> usize {
        self.shared.permits - self.available()
    }

    /// Acquire one permit with the default timeout.
    pub async fn acquire(&self) -> GonexResult<()> {
        self.acquire_timeout(self.shared.default_timeout).await
    }

    /// Acquire one permit; waiters are granted FIFO.
    pub async fn acquire_timeout(&self, timeout: Timeout) -> GonexResult<()> {
        validate_timeout(timeout.as_millis())?;
        let (id, rx) = {
            let mut st = self.shared.state.lock();
            if st.available > 0 {
                st.available -= 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let id = next_waiter_id();
            st.waiters.push_back(PermitWaiter { id, tx });
            (id, rx)
        };

        let mut wait = PermitWait {
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
                message: "semaphore waiter dropped without a grant".to_string(),
            }),
        }
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.shared.state.lock();
        if st.available > 0 {
            st.available -= 1;
            true
        } else {
            false
        }
    }

    /// Return one permit, granting it to the earliest waiter if any.
    pub fn release(&self) -> GonexResult<()> {
        let mut st = self.shared.state.lock();
        if st.available >= self.shared.permits {
            return Err(GonexError::Internal {
                message: "semaphore release without a matching acquire".to_string(),
            });
        }
        Self::grant_locked(&mut st);
        Ok(())
    }

    /// Hand the freed permit to the next live waiter, else bank it. Caller
    /// holds the state lock and owns the permit being returned.
    fn grant_locked(st: &mut State) {
        while let Some(w) = st.waiters.pop_front() {
            if w.tx.send(()).is_ok() {
                // Permit transferred; available is unchanged.
                return;
            }
        }
        st.available += 1;
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
            return Err(GonexError::SemaphoreTimeout {
                timeout_ms: timeout.as_millis(),
            });
        }
        match rx.try_recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(GonexError::Internal {
                message: "semaphore waiter vanished without a grant".to_string(),
            }),
        }
    }
}

/// Unregisters a dropped acquire future; a permit granted concurrently is
/// passed back so none leak.
struct PermitWait<'a> {
    shared: &'a Shared,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PermitWait<'_> {
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
            Semaphore::grant_locked(&mut st);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonex_core::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_release_accounting() {
        let sem = Semaphore::new(3).unwrap();
        sem.acquire().await.unwrap();
        sem.acquire().await.unwrap();
        assert_eq!(sem.available(), 1);
        assert_eq!(sem.in_use(), 2);
        assert_eq!(sem.available() + sem.in_use(), sem.permits());
        sem.release().unwrap();
        sem.release().unwrap();
        assert_eq!(sem.available(), 3);
    }

    #[tokio::test]
    async fn test_zero_permits_rejected() {
        assert!(Semaphore::new(0).is_err());
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let sem = Semaphore::new(1).unwrap();
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release().unwrap();
        assert!(sem.try_acquire());
    }

    #[tokio::test]
    async fn test_fifo_grants() {
        let sem = Semaphore::new(1).unwrap();
        sem.acquire().await.unwrap();

        let order = Arc::new(PlMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let sem = sem.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                sem.acquire_timeout(Timeout::INFINITE).await.unwrap();
                order.lock().push(i);
                sem.release().unwrap();
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sem.release().unwrap();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let sem = Semaphore::new(1).unwrap();
        sem.acquire().await.unwrap();
        let err = sem
            .acquire_timeout(Timeout::from_millis(30).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SemaphoreTimeout);
        sem.release().unwrap();
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_release_without_acquire_errors() {
        let sem = Semaphore::new(2).unwrap();
        assert!(sem.release().is_err());
    }
}
