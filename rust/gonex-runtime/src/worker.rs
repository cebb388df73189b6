//! Worker threads and the environment registered functions run in.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use gonex_core::{GonexError, GonexResult};
use gonex_shm::{SharedMemoryBuffer, SharedMemoryManager, SharedMutex, SharedSemaphore};

use crate::marshal::TaskValue;
use crate::proxy::{ChannelProxy, ContextProxy, ContextStateRegistry, MutexProxy, SemaphoreProxy};
use crate::registry::FunctionRegistry;

/// Lifecycle of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Error,
}

/// Shared-memory mutexes and semaphores addressable by handle key. Shared
/// between the main thread and every worker.
#[derive(Clone, Default)]
pub struct SharedSyncRegistry {
    mutexes: Arc<DashMap<String, Arc<SharedMutex>>>,
    semaphores: Arc<DashMap<String, Arc<SharedSemaphore>>>,
}

impl SharedSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_mutex(&self, key: &str, m: Arc<SharedMutex>) {
        self.mutexes.insert(key.to_string(), m);
    }

    pub fn insert_semaphore(&self, key: &str, s: Arc<SharedSemaphore>) {
        self.semaphores.insert(key.to_string(), s);
    }

    pub fn mutex(&self, key: &str) -> Option<Arc<SharedMutex>> {
        self.mutexes.get(key).map(|m| m.clone())
    }

    pub fn semaphore(&self, key: &str) -> Option<Arc<SharedSemaphore>> {
        self.semaphores.get(key).map(|s| s.clone())
    }
}

/// Environment a registered function executes in: resolves handle
/// arguments into typed proxies.
pub struct WorkerEnv {
    worker_id: usize,
    sync: SharedSyncRegistry,
    ctx_states: ContextStateRegistry,
    manager: SharedMemoryManager,
}

impl WorkerEnv {
    pub(crate) fn new(
        worker_id: usize,
        sync: SharedSyncRegistry,
        ctx_states: ContextStateRegistry,
        manager: SharedMemoryManager,
    ) -> Self {
        Self {
            worker_id,
            sync,
            ctx_states,
            manager,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Install a context proxy from a snapshot argument.
    pub fn context(&self, value: &TaskValue) -> GonexResult<ContextProxy> {
        match value {
            TaskValue::Context(snapshot) => {
                Ok(ContextProxy::new(snapshot.clone(), self.ctx_states.clone()))
            }
            _ => Err(handle_mismatch("Context", value)),
        }
    }

    /// Install a channel proxy from a channel handle argument.
    pub fn channel(&self, value: &TaskValue) -> GonexResult<ChannelProxy> {
        match value {
            TaskValue::Channel(handle) => Ok(ChannelProxy::new(handle.clone())),
            _ => Err(handle_mismatch("Channel", value)),
        }
    }

    /// Resolve a shared-memory mutex proxy. Its lock state lives in a
    /// shared cell, so exclusion holds for real.
    pub fn mutex(&self, value: &TaskValue) -> GonexResult<MutexProxy> {
        match value {
            TaskValue::SharedMutex(handle) => self
                .sync
                .mutex(&handle.key)
                .map(MutexProxy::new)
                .ok_or_else(|| GonexError::BufferNotFound {
                    name: handle.key.clone(),
                }),
            _ => Err(handle_mismatch("SharedMutex", value)),
        }
    }

    /// Resolve a shared-memory semaphore proxy.
    pub fn semaphore(&self, value: &TaskValue) -> GonexResult<SemaphoreProxy> {
        match value {
            TaskValue::SharedSemaphore(handle) => self
                .sync
                .semaphore(&handle.key)
                .map(SemaphoreProxy::new)
                .ok_or_else(|| GonexError::BufferNotFound {
                    name: handle.key.clone(),
                }),
            _ => Err(handle_mismatch("SharedSemaphore", value)),
        }
    }

    /// Resolve a shared buffer by manager name.
    pub fn buffer(&self, value: &TaskValue) -> GonexResult<Arc<SharedMemoryBuffer>> {
        match value {
            TaskValue::Buffer(name) => self.manager.get(name),
            _ => Err(handle_mismatch("Buffer", value)),
        }
    }
}

fn handle_mismatch(expected: &str, got: &TaskValue) -> GonexError {
    GonexError::MarshalUnsupported {
        type_name: format!("expected a {expected} handle, got {got:?}"),
    }
}

/// One unit of work shipped to a worker thread.
pub(crate) struct Job {
    pub id: Uuid,
    pub function_id: String,
    pub args: Vec<TaskValue>,
    pub result_tx: oneshot::Sender<GonexResult<TaskValue>>,
    /// Buffer names referenced by the args, dissociated on completion.
    pub buffers: Vec<String>,
}

/// Run a worker thread's job loop. Returns when the job channel closes
/// (shutdown) or a job panics (the pool replaces the worker).
pub(crate) fn run_worker(
    worker_id: usize,
    jobs: Receiver<Job>,
    registry: FunctionRegistry,
    env: WorkerEnv,
    state: Arc<PlMutex<WorkerState>>,
    queued: Arc<AtomicUsize>,
    manager: SharedMemoryManager,
) {
    debug!(worker = worker_id, "worker starting");
    *state.lock() = WorkerState::Idle;
    while let Ok(job) = jobs.recv() {
        queued.fetch_sub(1, Ordering::SeqCst);
        *state.lock() = WorkerState::Busy;
        debug!(worker = worker_id, job = %job.id, function = %job.function_id, "executing");

        let outcome = match registry.get(&job.function_id) {
            Ok(f) => catch_unwind(AssertUnwindSafe(|| f(&env, job.args))),
            Err(e) => Ok(Err(e)),
        };

        for name in &job.buffers {
            manager.dissociate_worker(name, worker_id);
        }

        match outcome {
            Ok(result) => {
                let _ = job.result_tx.send(result);
                *state.lock() = WorkerState::Idle;
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(worker = worker_id, job = %job.id, message = %message, "worker panicked; it will be replaced");
                let _ = job.result_tx.send(Err(GonexError::WorkerFailed {
                    worker_id,
                    message,
                }));
                *state.lock() = WorkerState::Error;
                manager.dissociate_worker_everywhere(worker_id);
                return;
            }
        }
    }
    debug!(worker = worker_id, "worker shutting down");
    manager.dissociate_worker_everywhere(worker_id);
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_rejects_mismatched_handles() {
        let env = WorkerEnv::new(
            0,
            SharedSyncRegistry::new(),
            Arc::new(DashMap::new()),
            SharedMemoryManager::new(),
        );
        assert!(env.context(&TaskValue::Int(1)).is_err());
        assert!(env.channel(&TaskValue::Null).is_err());
        assert!(env.mutex(&TaskValue::Bool(true)).is_err());
    }

    #[test]
    fn test_env_resolves_shared_mutex() {
        let sync = SharedSyncRegistry::new();
        sync.insert_mutex("m1", Arc::new(SharedMutex::new(None)));
        let env = WorkerEnv::new(
            0,
            sync,
            Arc::new(DashMap::new()),
            SharedMemoryManager::new(),
        );
        let proxy = env
            .mutex(&TaskValue::SharedMutex(crate::marshal::SyncHandle {
                key: "m1".to_string(),
            }))
            .unwrap();
        assert!(proxy.try_lock());
        proxy.unlock().unwrap();
    }
}
