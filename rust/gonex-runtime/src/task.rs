//! Task identity, options, and the handle returned by spawn.

use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use gonex_core::{GonexError, GonexResult, Timeout};

/// Lifecycle of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Error hook invoked when a task fails.
pub type ErrorHook = Arc<dyn Fn(&GonexError) + Send + Sync>;

/// Options accepted by spawn.
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Dispatch to the worker-thread backend instead of the cooperative one.
    pub parallel: bool,
    /// Per-call deadline; `Timeout::INFINITE` disables it.
    pub timeout: Timeout,
    /// Diagnostic name carried into errors and logs.
    pub name: Option<String>,
    /// Called with the failure before the handle resolves.
    pub on_error: Option<ErrorHook>,
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("parallel", &self.parallel)
            .field("timeout", &self.timeout)
            .field("name", &self.name)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Handle to a spawned task. Dropping the handle detaches the task; it
/// keeps running. [`TaskHandle::cancel`] stops it.
pub struct TaskHandle<T> {
    id: Uuid,
    name: Option<String>,
    state: Arc<PlMutex<TaskState>>,
    join: JoinHandle<GonexResult<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        name: Option<String>,
        state: Arc<PlMutex<TaskState>>,
        join: JoinHandle<GonexResult<T>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            state,
            join,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the task. Its future settles as `Cancelled`.
    pub fn cancel(&self) {
        self.join.abort();
        let mut st = self.state.lock();
        if matches!(*st, TaskState::Queued | TaskState::Running) {
            *st = TaskState::Cancelled;
        }
    }

    /// Wait for the task to settle and take its result.
    pub async fn join(self) -> GonexResult<T> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(GonexError::TaskFailed {
                name: self.name.clone(),
                message: "task was cancelled".to_string(),
            }),
            Err(e) => {
                *self.state.lock() = TaskState::Failed;
                Err(GonexError::TaskFailed {
                    name: self.name.clone(),
                    message: format!("task panicked: {e}"),
                })
            }
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
