//! One-shot initialization latch with retry on failure.
//!
//! The first caller runs the initializer while concurrent callers wait. A
//! success latches the `Once` forever; a failure rejects the callers that
//! were waiting on this attempt and resets the latch so the next call
//! re-attempts.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;

use gonex_core::{GonexError, GonexResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pristine,
    Running,
    Done,
}

struct State {
    phase: Phase,
    waiters: Vec<oneshot::Sender<GonexResult<()>>>,
}

/// A one-shot initialization latch. Cloning shares the same latch.
#[derive(Clone)]
pub struct Once {
    state: Arc<PlMutex<State>>,
}

impl Once {
    pub fn new() -> Self {
        Self {
            state: Arc::new(PlMutex::new(State {
                phase: Phase::Pristine,
                waiters: Vec::new(),
            })),
        }
    }

    /// Whether a previous call succeeded.
    pub fn is_done(&self) -> bool {
        self.state.lock().phase == Phase::Done
    }

    /// Run `f` exactly once. Concurrent callers wait for the running
    /// attempt and share its outcome; after a success every call is a no-op.
    pub async fn call<F, Fut>(&self, f: F) -> GonexResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GonexResult<()>>,
    {
        let rx = {
            let mut st = self.state.lock();
            match st.phase {
                Phase::Done => return Ok(()),
                Phase::Running => {
                    let (tx, rx) = oneshot::channel();
                    st.waiters.push(tx);
                    Some(rx)
                }
                Phase::Pristine => {
                    st.phase = Phase::Running;
                    None
                }
            }
        };

        if let Some(rx) = rx {
            return match rx.await {
                Ok(result) => result,
                Err(_) => Err(GonexError::Internal {
                    message: "once initializer vanished".to_string(),
                }),
            };
        }

        // We are the initializer. The guard resets the latch if the future
        // is dropped mid-run so the next caller can retry.
        let guard = RunGuard {
            state: &self.state,
            finished: false,
        };
        let result = f().await;
        self.finish(guard, result)
    }

    fn finish(&self, mut guard: RunGuard<'_>, result: GonexResult<()>) -> GonexResult<()> {
        guard.finished = true;
        let (waiters, outcome) = {
            let mut st = self.state.lock();
            match &result {
                Ok(()) => st.phase = Phase::Done,
                Err(_) => st.phase = Phase::Pristine,
            }
            let outcome = result.clone().map_err(|e| GonexError::OnceFailed {
                message: e.to_string(),
            });
            (std::mem::take(&mut st.waiters), outcome)
        };
        for w in waiters {
            let _ = w.send(outcome.clone());
        }
        result
    }
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets a latch whose initializer future was dropped before finishing,
/// releasing any queued waiters to retry.
struct RunGuard<'a> {
    state: &'a PlMutex<State>,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let waiters = {
            let mut st = self.state.lock();
            st.phase = Phase::Pristine;
            std::mem::take(&mut st.waiters)
        };
        for w in waiters {
            let _ = w.send(Err(GonexError::OnceFailed {
                message: "initializer was cancelled".to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonex_core::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_exactly_once_on_success() {
        let once = Once::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = count.clone();
            once.call(|| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(once.is_done());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_outcome() {
        let once = Once::new();
        let count = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let once = once.clone();
            let c = count.clone();
            handles.push(tokio::spawn(async move {
                once.call(|| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_rejects_waiters_and_allows_retry() {
        let once = Once::new();

        // Concurrent callers during a failing attempt all see the failure.
        let mut handles = Vec::new();
        for _ in 0..3 {
            let once = once.clone();
            handles.push(tokio::spawn(async move {
                once.call(|| async {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Err(GonexError::Internal {
                        message: "boom".to_string(),
                    })
                })
                .await
            }));
        }
        let mut failures = 0;
        for h in handles {
            if h.await.unwrap().is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
        assert!(!once.is_done());

        // The next call re-attempts and can succeed.
        once.call(|| async { Ok(()) }).await.unwrap();
        assert!(once.is_done());

        // Later calls are no-ops.
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        once.call(|| async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_waiters_get_once_failed_kind() {
        let once = Once::new();
        let waiter = {
            let once = once.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                once.call(|| async { Ok(()) }).await
            })
        };
        let result = once
            .call(|| async {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                Err(GonexError::Internal {
                    message: "init failed".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        let werr = waiter.await.unwrap().unwrap_err();
        assert_eq!(werr.kind(), ErrorKind::OnceFailed);
    }
}
