//! The parallel backend: a fixed pool of OS worker threads.
//!
//! Jobs go to the worker with the shortest queue (ties round-robin). A
//! worker that panics fails its in-flight job and is replaced before the
//! next dispatch to it. Shutdown closes the job channels, lets busy
//! workers finish the current job bounded by the configured task timeout,
//! and joins the threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use gonex_core::{validate_concurrency, GonexError, GonexResult, Timeout, DEFAULT_TIMEOUT};
use gonex_shm::SharedMemoryManager;

use crate::marshal::TaskValue;
use crate::proxy::ContextStateRegistry;
use crate::registry::FunctionRegistry;
use crate::worker::{run_worker, Job, SharedSyncRegistry, WorkerEnv, WorkerState};

/// Options accepted by [`WorkerPool::new`].
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Worker thread count; defaults to the CPU count.
    pub thread_count: usize,
    /// Bound on a single task, also the per-worker drain bound at shutdown.
    pub task_timeout: Timeout,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            thread_count: num_cpus::get(),
            task_timeout: Timeout::from_millis(DEFAULT_TIMEOUT).unwrap_or(Timeout::INFINITE),
        }
    }
}

struct WorkerSlot {
    id: usize,
    sender: Option<Sender<Job>>,
    queued: Arc<AtomicUsize>,
    state: Arc<PlMutex<WorkerState>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// A fixed pool of worker threads executing registered functions.
pub struct WorkerPool {
    config: ParallelConfig,
    registry: FunctionRegistry,
    sync: SharedSyncRegistry,
    ctx_states: ContextStateRegistry,
    manager: SharedMemoryManager,
    workers: PlMutex<Vec<WorkerSlot>>,
    round_robin: AtomicUsize,
    next_worker_id: AtomicUsize,
    shutdown: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: ParallelConfig,
        registry: FunctionRegistry,
        sync: SharedSyncRegistry,
        ctx_states: ContextStateRegistry,
        manager: SharedMemoryManager,
    ) -> GonexResult<Arc<Self>> {
        validate_concurrency(config.thread_count as i64)?;
        let pool = Arc::new(Self {
            config,
            registry,
            sync,
            ctx_states,
            manager,
            workers: PlMutex::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        {
            let mut workers = pool.workers.lock();
            for _ in 0..pool.config.thread_count {
                workers.push(pool.spawn_worker());
            }
        }
        info!(threads = pool.config.thread_count, "parallel backend initialized");
        Ok(pool)
    }

    pub fn thread_count(&self) -> usize {
        self.config.thread_count
    }

    pub fn task_timeout(&self) -> Timeout {
        self.config.task_timeout
    }

    /// Jobs accepted but not yet started.
    pub fn queued_jobs(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .map(|w| w.queued.load(Ordering::SeqCst))
            .sum()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.lock().iter().map(|w| *w.state.lock()).collect()
    }

    /// Hand a job to the pool. The receiver resolves with the task's
    /// result; a worker death surfaces as `WorkerFailed`.
    pub fn submit(
        &self,
        function_id: &str,
        args: Vec<TaskValue>,
    ) -> GonexResult<oneshot::Receiver<GonexResult<TaskValue>>> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(GonexError::Internal {
                message: "worker pool is shut down".to_string(),
            });
        }
        // Validation before any side effect.
        if !self.registry.contains(function_id) {
            return Err(GonexError::FunctionNotRegistered {
                id: function_id.to_string(),
            });
        }

        let buffers = collect_buffer_names(&args);
        let (tx, rx) = oneshot::channel();
        let jid = Uuid::new_v4();
        eprintln!("DEBUG submit creating job id={}", jid);
        let job = Job {
            id: jid,
            function_id: function_id.to_string(),
            args,
            result_tx: tx,
            buffers: buffers.clone(),
        };

        let mut workers = self.workers.lock();
        let index = self.pick_worker(&mut workers);
        let worker_id = workers[index].id;
        for name in &buffers {
            // A stale handle is a caller bug; surface it before dispatch.
            self.manager.associate_worker(name, worker_id)?;
        }
        workers[index].queued.fetch_add(1, Ordering::SeqCst);
        eprintln!("DEBUG about to send job id={} to worker_id={} sender_is_some={}", jid, worker_id, workers[index].sender.is_some());
        let send_result = match &workers[index].sender {
            Some(sender) => sender.send(job),
            None => Err(crossbeam_channel::SendError(job)),
        };
        eprintln!("DEBUG primary send_result is_ok={}", send_result.is_ok());
        if let Err(crossbeam_channel::SendError(job)) = send_result {
            // The worker died between selection and dispatch; replace it
            // and run the job on the replacement.
            warn!(worker = worker_id, "worker channel closed; replacing");
            let replacement = self.spawn_worker();
            let new_id = replacement.id;
            workers[index] = replacement;
            for name in &buffers {
                self.manager.dissociate_worker(name, worker_id);
                self.manager.associate_worker(name, new_id)?;
            }
            workers[index].queued.fetch_add(1, Ordering::SeqCst);
            if let Some(sender) = &workers[index].sender {
                sender.send(job).map_err(|_| GonexError::WorkerFailed {
                    worker_id: new_id,
                    message: "replacement worker rejected the job".to_string(),
                })?;
            }
        }
        eprintln!("DEBUG submit returning rx for job id={}", jid);
        Ok(rx)
    }

    /// Stop accepting work, drain, and join the worker threads. Busy
    /// workers get the configured task timeout to finish.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let (threads, drain_bound) = {
            let mut workers = self.workers.lock();
            let mut threads = Vec::new();
            for w in workers.iter_mut() {
                // Dropping the sender closes the job channel; the worker
                // finishes its current job and exits.
                w.sender.take();
                if let Some(t) = w.thread.take() {
                    threads.push(t);
                }
            }
            (threads, self.config.task_timeout)
        };

        let join_all = tokio::task::spawn_blocking(move || {
            for t in threads {
                let _ = t.join();
            }
        });
        match drain_bound.as_duration() {
            Some(d) => {
                if tokio::time::timeout(d, join_all).await.is_err() {
                    warn!("worker threads did not drain within the task timeout");
                }
            }
            None => {
                let _ = join_all.await;
            }
        }
        info!("parallel backend shut down");
    }

    /// Shortest queue wins; ties resolved round-robin. Dead workers are
    /// replaced before they can be picked.
    fn pick_worker(&self, workers: &mut [WorkerSlot]) -> usize {
        for w in workers.iter_mut() {
            if *w.state.lock() == WorkerState::Error {
                let old_id = w.id;
                *w = self.spawn_worker();
                warn!(old_worker = old_id, new_worker = w.id, "replaced failed worker");
            }
        }
        let min_queue = workers
            .iter()
            .map(|w| w.queued.load(Ordering::SeqCst))
            .min()
            .unwrap_or(0);
        let candidates: Vec<usize> = workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.queued.load(Ordering::SeqCst) == min_queue)
            .map(|(i, _)| i)
            .collect();
        let rr = self.round_robin.fetch_add(1, Ordering::SeqCst);
        candidates[rr % candidates.len()]
    }

    fn spawn_worker(&self) -> WorkerSlot {
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let queued = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(PlMutex::new(WorkerState::Starting));
        let env = WorkerEnv::new(
            id,
            self.sync.clone(),
            self.ctx_states.clone(),
            self.manager.clone(),
        );
        let registry = self.registry.clone();
        let manager = self.manager.clone();
        let thread_state = state.clone();
        let thread_queued = queued.clone();
        let thread = thread::Builder::new()
            .name(format!("gonex-worker-{id}"))
            .spawn(move || {
                run_worker(id, rx, registry, env, thread_state, thread_queued, manager);
            })
            .ok();
        if thread.is_none() {
            *state.lock() = WorkerState::Error;
        }
        WorkerSlot {
            id,
            sender: Some(tx),
            queued,
            state,
            thread,
        }
    }
}

/// Buffer names referenced anywhere in an argument tree.
fn collect_buffer_names(args: &[TaskValue]) -> Vec<String> {
    fn walk(value: &TaskValue, out: &mut Vec<String>) {
        match value {
            TaskValue::Buffer(name) => out.push(name.clone()),
            TaskValue::List(items) => {
                for v in items {
                    walk(v, out);
                }
            }
            TaskValue::Map(map) => {
                for v in map.values() {
                    walk(v, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    for v in args {
        walk(v, &mut out);
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;

    fn pool_with(registry: FunctionRegistry, threads: usize) -> Arc<WorkerPool> {
        WorkerPool::new(
            ParallelConfig {
                thread_count: threads,
                task_timeout: Timeout::from_millis(5_000).unwrap_or(Timeout::INFINITE),
            },
            registry,
            SharedSyncRegistry::new(),
            Arc::new(DashMap::new()),
            SharedMemoryManager::new(),
        )
        .expect("pool")
    }

    #[tokio::test]
    async fn test_submit_executes_on_worker() {
        let registry = FunctionRegistry::new();
        registry.register("double", |_env, args| {
            let n = args.first().and_then(TaskValue::as_int).unwrap_or(0);
            Ok(TaskValue::Int(n * 2))
        });
        let pool = pool_with(registry, 2);
        let rx = pool.submit("double", vec![TaskValue::Int(21)]).unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), TaskValue::Int(42));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_function_fails_before_dispatch() {
        let pool = pool_with(FunctionRegistry::new(), 1);
        let err = pool.submit("missing", vec![]).unwrap_err();
        assert_eq!(err.kind(), gonex_core::ErrorKind::FunctionNotRegistered);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_worker_fails_task_and_is_replaced() {
        let registry = FunctionRegistry::new();
        registry.register("explode", |_env, _args| panic!("kaboom"));
        registry.register("ok", |_env, _args| Ok(TaskValue::Int(1)));
        let pool = pool_with(registry, 1);

        let rx = pool.submit("explode", vec![]).unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), gonex_core::ErrorKind::WorkerFailed);

        // The pool replaces the dead worker; later jobs still run.
        let rx = pool.submit("ok", vec![]).unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), TaskValue::Int(1));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_many_jobs_spread_over_pool() {
        let registry = FunctionRegistry::new();
        registry.register("id", |env, args| {
            let n = args.first().and_then(TaskValue::as_int).unwrap_or(0);
            // Encode which worker ran it, for the distribution check.
            Ok(TaskValue::List(vec![
                TaskValue::Int(n),
                TaskValue::Int(env.worker_id() as i64),
            ]))
        });
        let pool = pool_with(registry, 4);
        let mut rxs = Vec::new();
        for i in 0..32 {
            rxs.push(pool.submit("id", vec![TaskValue::Int(i)]).unwrap());
        }
        let mut seen = std::collections::HashSet::new();
        let mut workers = std::collections::HashSet::new();
        for rx in rxs {
            let TaskValue::List(pair) = rx.await.unwrap().unwrap() else {
                panic!("expected a pair");
            };
            seen.insert(pair[0].as_int().unwrap_or(-1));
            workers.insert(pair[1].as_int().unwrap_or(-1));
        }
        assert_eq!(seen.len(), 32);
        assert!(workers.len() > 1, "jobs should spread across workers");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let registry = FunctionRegistry::new();
        registry.register("ok", |_env, _args| Ok(TaskValue::Null));
        let pool = pool_with(registry, 1);
        pool.shutdown().await;
        assert!(pool.submit("ok", vec![]).is_err());
    }
}
