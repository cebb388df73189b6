//! The runtime facade tying both backends together.
//!
//! A [`Runtime`] owns the function registry, the shared-memory manager,
//! the shared sync registry, and (once initialized) the worker pool.
//! Registered functions run on workers when the parallel backend is up and
//! the caller asked for it, and inline on the blocking thread pool
//! otherwise, behind the same handle type.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use tracing::warn;

use gonex_core::{GonexError, GonexResult};
use gonex_shm::{SharedMemoryManager, SharedMutex, SharedSemaphore};
use gonex_sync::Context;

use crate::cooperative;
use crate::marshal::{self, SyncHandle, TaskValue};
use crate::parallel::{ParallelConfig, WorkerPool};
use crate::proxy::ContextStateRegistry;
use crate::registry::FunctionRegistry;
use crate::task::{TaskHandle, TaskOptions};
use crate::worker::{SharedSyncRegistry, WorkerEnv};

/// Owns the pieces both backends share. Cloning shares the runtime.
#[derive(Clone)]
pub struct Runtime {
    registry: FunctionRegistry,
    sync: SharedSyncRegistry,
    ctx_states: ContextStateRegistry,
    manager: SharedMemoryManager,
    pool: Arc<PlMutex<Option<Arc<WorkerPool>>>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            registry: FunctionRegistry::new(),
            sync: SharedSyncRegistry::new(),
            ctx_states: Arc::new(DashMap::new()),
            manager: SharedMemoryManager::new(),
            pool: Arc::new(PlMutex::new(None)),
        }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn shared_memory(&self) -> &SharedMemoryManager {
        &self.manager
    }

    pub fn is_parallel_initialized(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Start the worker-thread backend. Idempotent; a second call with a
    /// different config is ignored with a warning.
    pub fn initialize_parallel(&self, config: ParallelConfig) -> GonexResult<()> {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            warn!("parallel backend already initialized; ignoring");
            return Ok(());
        }
        *pool = Some(WorkerPool::new(
            config,
            self.registry.clone(),
            self.sync.clone(),
            self.ctx_states.clone(),
            self.manager.clone(),
        )?);
        Ok(())
    }

    /// Drain and stop the worker-thread backend. Busy workers finish their
    /// current job bounded by the pool's task timeout.
    pub async fn shutdown_parallel(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
    }

    /// Spawn a future on the cooperative backend.
    pub fn spawn<F, T>(&self, future: F, options: TaskOptions) -> TaskHandle<T>
    where
        F: std::future::Future<Output = GonexResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        cooperative::spawn(future, options)
    }

    /// Spawn a registered function. With `options.parallel` and an
    /// initialized pool it runs on a worker thread; otherwise it runs on
    /// the blocking thread pool with a main-thread environment.
    pub fn spawn_fn(
        &self,
        function_id: &str,
        args: Vec<TaskValue>,
        options: TaskOptions,
    ) -> GonexResult<TaskHandle<TaskValue>> {
        let parallel_pool = if options.parallel {
            self.pool.lock().clone()
        } else {
            None
        };

        match parallel_pool {
            Some(pool) => {
                let rx = pool.submit(function_id, args)?;
                let name = options.name.clone();
                Ok(cooperative::spawn(
                    async move {
                        match rx.await {
                            Ok(result) => result,
                            Err(_) => Err(GonexError::WorkerFailed {
                                worker_id: 0,
                                message: "worker dropped the job before completion".to_string(),
                            }),
                        }
                    },
                    TaskOptions {
                        parallel: false,
                        name,
                        ..options
                    },
                ))
            }
            None => {
                let f = self.registry.get(function_id)?;
                let env = WorkerEnv::new(
                    usize::MAX,
                    self.sync.clone(),
                    self.ctx_states.clone(),
                    self.manager.clone(),
                );
                let name = options.name.clone();
                Ok(cooperative::spawn(
                    async move {
                        // Registered functions are synchronous compute; keep
                        // them off the async executor.
                        match tokio::task::spawn_blocking(move || f(&env, args)).await {
                            Ok(result) => result,
                            Err(e) => Err(GonexError::TaskFailed {
                                name: None,
                                message: format!("task panicked: {e}"),
                            }),
                        }
                    },
                    TaskOptions {
                        parallel: false,
                        name,
                        ..options
                    },
                ))
            }
        }
    }

    /// Create a shared-memory mutex addressable from workers via
    /// [`Runtime::shared_mutex_handle`].
    pub fn create_shared_mutex(&self, key: &str) -> Arc<SharedMutex> {
        let m = Arc::new(SharedMutex::new(Some(key.to_string())));
        self.sync.insert_mutex(key, m.clone());
        m
    }

    /// Create a shared-memory semaphore addressable from workers.
    pub fn create_shared_semaphore(
        &self,
        key: &str,
        permits: u32,
    ) -> GonexResult<Arc<SharedSemaphore>> {
        let s = Arc::new(SharedSemaphore::new(permits, Some(key.to_string()))?);
        self.sync.insert_semaphore(key, s.clone());
        Ok(s)
    }

    /// Handle for passing a shared mutex into a parallel task.
    pub fn shared_mutex_handle(&self, key: &str) -> GonexResult<TaskValue> {
        self.sync
            .mutex(key)
            .map(|_| {
                TaskValue::SharedMutex(SyncHandle {
                    key: key.to_string(),
                })
            })
            .ok_or_else(|| GonexError::BufferNotFound {
                name: key.to_string(),
            })
    }

    /// Handle for passing a shared semaphore into a parallel task.
    pub fn shared_semaphore_handle(&self, key: &str) -> GonexResult<TaskValue> {
        self.sync
            .semaphore(key)
            .map(|_| {
                TaskValue::SharedSemaphore(SyncHandle {
                    key: key.to_string(),
                })
            })
            .ok_or_else(|| GonexError::BufferNotFound {
                name: key.to_string(),
            })
    }

    /// Snapshot a context for a parallel task and arm the live-state
    /// bridge: when the context cancels, every proxy sees the cause.
    pub fn marshal_context(&self, ctx: &Context) -> TaskValue {
        let value = marshal::marshal_context(ctx);
        let id = ctx.id().to_string();
        if let Some(err) = ctx.err() {
            self.ctx_states.insert(id, err);
        } else {
            let states = self.ctx_states.clone();
            let watched = ctx.clone();
            tokio::spawn(async move {
                watched.done().await;
                if let Some(err) = watched.err() {
                    states.insert(id, err);
                }
            });
        }
        value
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonex_core::ErrorKind;
    use gonex_sync::context;

    #[tokio::test]
    async fn test_spawn_fn_inline_without_pool() {
        let rt = Runtime::new();
        rt.registry().register("add", |_env, args| {
            let a = args.first().and_then(TaskValue::as_int).unwrap_or(0);
            let b = args.get(1).and_then(TaskValue::as_int).unwrap_or(0);
            Ok(TaskValue::Int(a + b))
        });
        let handle = rt
            .spawn_fn(
                "add",
                vec![TaskValue::Int(2), TaskValue::Int(3)],
                TaskOptions::default(),
            )
            .unwrap();
        assert_eq!(handle.join().await.unwrap(), TaskValue::Int(5));
    }

    #[tokio::test]
    async fn test_spawn_fn_parallel_round_trip() {
        let rt = Runtime::new();
        rt.registry().register("square", |_env, args| {
            let n = args.first().and_then(TaskValue::as_int).unwrap_or(0);
            Ok(TaskValue::Int(n * n))
        });
        rt.initialize_parallel(ParallelConfig {
            thread_count: 2,
            ..ParallelConfig::default()
        })
        .unwrap();
        let handle = rt
            .spawn_fn(
                "square",
                vec![TaskValue::Int(7)],
                TaskOptions {
                    parallel: true,
                    ..TaskOptions::default()
                },
            )
            .unwrap();
        assert_eq!(handle.join().await.unwrap(), TaskValue::Int(49));
        rt.shutdown_parallel().await;
        assert!(!rt.is_parallel_initialized());
    }

    #[tokio::test]
    async fn test_context_state_bridge() {
        let rt = Runtime::new();
        let (ctx, canceler) = context::with_cancel(&context::background());
        let snapshot = rt.marshal_context(&ctx);

        let env = WorkerEnv::new(
            1,
            SharedSyncRegistry::new(),
            rt.ctx_states.clone(),
            SharedMemoryManager::new(),
        );
        let proxy = env.context(&snapshot).unwrap();
        assert!(proxy.err().is_none());

        canceler.cancel();
        // Give the watcher task a beat to bridge the state.
        gonex_sync::time::sleep(30).await;
        assert_eq!(
            proxy.err().map(|e| e.kind()),
            Some(ErrorKind::ContextCancelled)
        );
    }

    #[tokio::test]
    async fn test_shared_mutex_handle_round_trip() {
        let rt = Runtime::new();
        let m = rt.create_shared_mutex("lock-1");
        let handle = rt.shared_mutex_handle("lock-1").unwrap();

        let env = WorkerEnv::new(
            2,
            rt.sync.clone(),
            rt.ctx_states.clone(),
            rt.manager.clone(),
        );
        let proxy = env.mutex(&handle).unwrap();
        proxy.lock();
        // Exclusion is visible from the owning side too.
        assert!(m.is_locked());
        assert!(!m.try_lock());
        proxy.unlock().unwrap();
        assert!(!m.is_locked());
    }

    #[tokio::test]
    async fn test_missing_handle_keys_error() {
        let rt = Runtime::new();
        assert!(rt.shared_mutex_handle("nope").is_err());
        assert!(rt.shared_semaphore_handle("nope").is_err());
    }
}
