//! Cooperative backend: futures on the async executor with task
//! bookkeeping.
//!
//! Concurrency comes from yielding at the primitives (channel waits, lock
//! waits, sleeps); ready tasks run in FIFO spawn order with no priorities.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tracing::debug;

use gonex_core::{GonexError, GonexResult};

use crate::task::{TaskHandle, TaskOptions, TaskState};

/// Schedule a future with bookkeeping: state transitions, the per-call
/// timeout, and the `on_error` hook.
pub fn spawn<F, T>(future: F, options: TaskOptions) -> TaskHandle<T>
where
    F: Future<Output = GonexResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::new(PlMutex::new(TaskState::Queued));
    let task_state = state.clone();
    let name = options.name.clone();
    let task_name = name.clone();
    let timeout = options.timeout;
    let on_error = options.on_error.clone();

    let join = tokio::spawn(async move {
        *task_state.lock() = TaskState::Running;
        let result = match timeout.as_duration() {
            Some(d) => match tokio::time::timeout(d, future).await {
                Ok(r) => r,
                Err(_elapsed) => Err(GonexError::TaskTimeout {
                    name: task_name.clone(),
                    timeout_ms: timeout.as_millis(),
                }),
            },
            None => future.await,
        };
        match &result {
            Ok(_) => {
                *task_state.lock() = TaskState::Completed;
            }
            Err(e) => {
                *task_state.lock() = TaskState::Failed;
                debug!(task = ?task_name, error = %e, "task failed");
                if let Some(hook) = &on_error {
                    hook(e);
                }
            }
        }
        result
    });

    TaskHandle::new(name, state, join)
}

/// Spawn every future and wait for all of them; results come back in spawn
/// order.
pub async fn spawn_all<F, T>(futures: Vec<F>, options: TaskOptions) -> Vec<GonexResult<T>>
where
    F: Future<Output = GonexResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<TaskHandle<T>> = futures
        .into_iter()
        .map(|f| spawn(f, options.clone()))
        .collect();
    let mut results = Vec::with_capacity(handles.len());
    for h in handles {
        results.push(h.join().await);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonex_core::{ErrorKind, Timeout};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_spawn_completes() {
        let handle = spawn(async { Ok(21 * 2) }, TaskOptions::default());
        assert_eq!(handle.join().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let handle = spawn(
            async {
                gonex_sync::time::sleep(30).await;
                Ok(())
            },
            TaskOptions::default(),
        );
        gonex_sync::time::sleep(10).await;
        assert_eq!(handle.state(), TaskState::Running);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_invokes_hook_and_resolves_err() {
        let hook_hit = Arc::new(AtomicBool::new(false));
        let hit = hook_hit.clone();
        let handle = spawn(
            async {
                Err::<(), _>(GonexError::Internal {
                    message: "boom".to_string(),
                })
            },
            TaskOptions {
                on_error: Some(Arc::new(move |_| hit.store(true, Ordering::SeqCst))),
                ..TaskOptions::default()
            },
        );
        assert!(handle.join().await.is_err());
        assert!(hook_hit.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_per_call_timeout() {
        let handle = spawn(
            async {
                gonex_sync::time::sleep(10_000).await;
                Ok(())
            },
            TaskOptions {
                timeout: Timeout::from_millis(30).unwrap(),
                ..TaskOptions::default()
            },
        );
        let err = handle.join().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskTimeout);
    }

    #[tokio::test]
    async fn test_cancel() {
        let handle = spawn(
            async {
                gonex_sync::time::sleep(10_000).await;
                Ok(())
            },
            TaskOptions::default(),
        );
        gonex_sync::time::sleep(10).await;
        handle.cancel();
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(handle.join().await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_all_keeps_order() {
        let futures: Vec<_> = (0..5)
            .map(|i| async move {
                gonex_sync::time::sleep(5 * (5 - i as u64)).await;
                Ok(i)
            })
            .collect();
        let results = spawn_all(futures, TaskOptions::default()).await;
        let values: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }
}
