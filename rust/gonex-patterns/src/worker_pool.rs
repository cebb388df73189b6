//! Abstract worker pool: priority queue, autoscaling, pluggable balancing.
//!
//! The skeleton owns the pending queue, worker bookkeeping, and scaling
//! decisions; a [`PoolBackend`] supplies what a worker actually is via
//! `create_worker`, `destroy_worker`, and `execute_task`.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use gonex_core::{GonexError, GonexResult};

/// Sizing and scaling thresholds for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Idle longer than this makes a worker a scale-down candidate.
    pub idle_timeout: Duration,
    /// Busy-ratio above which the pool grows.
    pub scale_up_threshold: f64,
    /// Busy-ratio below which the pool shrinks toward `min_workers`.
    pub scale_down_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            idle_timeout: Duration::from_secs(30),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
        }
    }
}

/// Picks a worker index given per-worker in-flight counts.
pub trait LoadBalancer: Send + Sync {
    fn pick(&self, loads: &[usize]) -> usize;
}

/// Cycles through workers regardless of load.
#[derive(Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer for RoundRobinBalancer {
    fn pick(&self, loads: &[usize]) -> usize {
        if loads.is_empty() {
            return 0;
        }
        self.counter.fetch_add(1, Ordering::Relaxed) % loads.len()
    }
}

/// Picks the worker with the fewest in-flight tasks.
#[derive(Default)]
pub struct LeastLoadedBalancer;

impl LoadBalancer for LeastLoadedBalancer {
    fn pick(&self, loads: &[usize]) -> usize {
        loads
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| **l)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// What a concrete pool provides.
#[async_trait]
pub trait PoolBackend: Send + Sync + 'static {
    type Task: Send + 'static;
    type Output: Send + 'static;

    async fn create_worker(&self, worker_id: usize) -> GonexResult<()>;
    async fn destroy_worker(&self, worker_id: usize) -> GonexResult<()>;
    async fn execute_task(&self, worker_id: usize, task: Self::Task)
        -> GonexResult<Self::Output>;
}

struct QueuedTask<T, O> {
    priority: u32,
    seq: u64,
    task: T,
    result_tx: oneshot::Sender<GonexResult<O>>,
}

impl<T, O> PartialEq for QueuedTask<T, O> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl<T, O> Eq for QueuedTask<T, O> {}
impl<T, O> PartialOrd for QueuedTask<T, O> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T, O> Ord for QueuedTask<T, O> {
    /// Max-heap on priority; earlier arrivals first among equals.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct WorkerInfo {
    id: usize,
    in_flight: Arc<AtomicUsize>,
    last_active: Arc<PlMutex<Instant>>,
}

/// The abstract pool. Concrete pools wrap one with their backend.
pub struct WorkerPoolSkeleton<B: PoolBackend> {
    backend: Arc<B>,
    config: PoolConfig,
    balancer: Arc<dyn LoadBalancer>,
    queue: PlMutex<BinaryHeap<QueuedTask<B::Task, B::Output>>>,
    workers: PlMutex<Vec<WorkerInfo>>,
    next_worker_id: AtomicUsize,
    seq: AtomicU64,
}

impl<B: PoolBackend> WorkerPoolSkeleton<B> {
    pub async fn new(
        backend: Arc<B>,
        config: PoolConfig,
        balancer: Arc<dyn LoadBalancer>,
    ) -> GonexResult<Arc<Self>> {
        if config.min_workers == 0 || config.min_workers > config.max_workers {
            return Err(GonexError::InvalidConcurrency {
                value: config.min_workers as i64,
            });
        }
        let pool = Arc::new(Self {
            backend,
            config,
            balancer,
            queue: PlMutex::new(BinaryHeap::new()),
            workers: PlMutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        });
        for _ in 0..pool.config.min_workers {
            pool.add_worker().await?;
        }
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn queued_tasks(&self) -> usize {
        self.queue.lock().len()
    }

    /// In-flight tasks divided by worker count.
    pub fn utilization(&self) -> f64 {
        let workers = self.workers.lock();
        if workers.is_empty() {
            return 0.0;
        }
        let busy: usize = workers
            .iter()
            .map(|w| w.in_flight.load(Ordering::Relaxed).min(1))
            .sum();
        busy as f64 / workers.len() as f64
    }

    /// Queue a task and drive the pool: scale if thresholds say so, then
    /// dispatch everything that has a worker to run on.
    pub async fn submit(
        &self,
        priority: u32,
        task: B::Task,
    ) -> oneshot::Receiver<GonexResult<B::Output>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock();
            queue.push(QueuedTask {
                priority,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                task,
                result_tx: tx,
            });
        }
        if let Err(e) = self.autoscale().await {
            warn!(error = %e, "autoscale failed");
        }
        self.dispatch();
        rx
    }

    /// Pop queued tasks and hand each to a balancer-picked worker.
    fn dispatch(&self) {
        loop {
            let Some(next) = self.queue.lock().pop() else { return };
            let (worker_id, in_flight, last_active) = {
                let workers = self.workers.lock();
                if workers.is_empty() {
                    // No workers (shutdown); fail the task.
                    let _ = next.result_tx.send(Err(GonexError::Internal {
                        message: "worker pool has no workers".to_string(),
                    }));
                    return;
                }
                let loads: Vec<usize> = workers
                    .iter()
                    .map(|w| w.in_flight.load(Ordering::Relaxed))
                    .collect();
                let index = self.balancer.pick(&loads).min(workers.len() - 1);
                let w = &workers[index];
                (w.id, w.in_flight.clone(), w.last_active.clone())
            };
            in_flight.fetch_add(1, Ordering::Relaxed);
            let backend = self.backend.clone();
            tokio::spawn(async move {
                let result = backend.execute_task(worker_id, next.task).await;
                in_flight.fetch_sub(1, Ordering::Relaxed);
                *last_active.lock() = Instant::now();
                let _ = next.result_tx.send(result);
            });
        }
    }

    /// Grow past the busy threshold, shrink idle workers below the other,
    /// always staying within `[min_workers, max_workers]`.
    async fn autoscale(&self) -> GonexResult<()> {
        let utilization = self.utilization();
        let count = self.worker_count();
        if utilization >= self.config.scale_up_threshold && count < self.config.max_workers {
            self.add_worker().await?;
            debug!(workers = count + 1, utilization, "scaled up");
            return Ok(());
        }
        if utilization <= self.config.scale_down_threshold && count > self.config.min_workers {
            let victim = {
                let workers = self.workers.lock();
                workers
                    .iter()
                    .filter(|w| w.in_flight.load(Ordering::Relaxed) == 0)
                    .filter(|w| w.last_active.lock().elapsed() >= self.config.idle_timeout)
                    .map(|w| w.id)
                    .next()
            };
            if let Some(id) = victim {
                self.remove_worker(id).await?;
                debug!(worker = id, "scaled down idle worker");
            }
        }
        Ok(())
    }

    async fn add_worker(&self) -> GonexResult<()> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.backend.create_worker(id).await?;
        self.workers.lock().push(WorkerInfo {
            id,
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_active: Arc::new(PlMutex::new(Instant::now())),
        });
        Ok(())
    }

    async fn remove_worker(&self, id: usize) -> GonexResult<()> {
        let removed = {
            let mut workers = self.workers.lock();
            let before = workers.len();
            workers.retain(|w| w.id != id);
            before != workers.len()
        };
        if removed {
            self.backend.destroy_worker(id).await?;
        }
        Ok(())
    }

    /// Destroy every worker. Queued tasks fail on the next dispatch.
    pub async fn shutdown(&self) -> GonexResult<()> {
        let ids: Vec<usize> = {
            let mut workers = self.workers.lock();
            let ids = workers.iter().map(|w| w.id).collect();
            workers.clear();
            ids
        };
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.backend.destroy_worker(id).await {
                errors.push(e);
            }
        }
        match GonexError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoBackend {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl EchoBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PoolBackend for EchoBackend {
        type Task = (u32, u64);
        type Output = (u32, usize);

        async fn create_worker(&self, _id: usize) -> GonexResult<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn destroy_worker(&self, _id: usize) -> GonexResult<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn execute_task(&self, worker_id: usize, task: Self::Task) -> GonexResult<(u32, usize)> {
            gonex_sync::time::sleep(task.1).await;
            Ok((task.0, worker_id))
        }
    }

    #[tokio::test]
    async fn test_submit_executes() {
        let backend = EchoBackend::new();
        let pool = WorkerPoolSkeleton::new(
            backend.clone(),
            PoolConfig::default(),
            Arc::new(LeastLoadedBalancer),
        )
        .await
        .unwrap();
        let rx = pool.submit(5, (5, 0)).await;
        let (tag, _worker) = rx.await.unwrap().unwrap();
        assert_eq!(tag, 5);
        assert_eq!(backend.created.load(Ordering::SeqCst), 1);
        pool.shutdown().await.unwrap();
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_sizing_rejected() {
        let backend = EchoBackend::new();
        let bad = PoolConfig {
            min_workers: 0,
            ..PoolConfig::default()
        };
        assert!(
            WorkerPoolSkeleton::new(backend, bad, Arc::new(LeastLoadedBalancer))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_scales_up_under_load() {
        let backend = EchoBackend::new();
        let pool = WorkerPoolSkeleton::new(
            backend.clone(),
            PoolConfig {
                min_workers: 1,
                max_workers: 4,
                scale_up_threshold: 0.5,
                ..PoolConfig::default()
            },
            Arc::new(LeastLoadedBalancer),
        )
        .await
        .unwrap();

        let mut rxs = Vec::new();
        for i in 0..6 {
            rxs.push(pool.submit(1, (i, 50)).await);
        }
        for rx in rxs {
            rx.await.unwrap().unwrap();
        }
        assert!(
            pool.worker_count() > 1,
            "pool should have scaled past min_workers"
        );
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_orders_queue() {
        // A single busy worker forces queueing, so priorities decide order.
        let backend = EchoBackend::new();
        let pool = WorkerPoolSkeleton::new(
            backend,
            PoolConfig {
                min_workers: 1,
                max_workers: 1,
                ..PoolConfig::default()
            },
            Arc::new(RoundRobinBalancer::default()),
        )
        .await
        .unwrap();

        // The queue drains in priority order at each dispatch round; with
        // everything queued before dispatch, higher priorities pop first.
        let low = {
            let mut q = pool.queue.lock();
            let (tx, rx) = oneshot::channel();
            q.push(QueuedTask {
                priority: 1,
                seq: 0,
                task: (1, 0),
                result_tx: tx,
            });
            let (tx2, rx2) = oneshot::channel();
            q.push(QueuedTask {
                priority: 9,
                seq: 1,
                task: (9, 0),
                result_tx: tx2,
            });
            (rx, rx2)
        };
        // Peek order before dispatch: the high-priority task is on top.
        assert_eq!(pool.queue.lock().peek().map(|t| t.priority), Some(9));
        pool.dispatch();
        low.0.await.unwrap().unwrap();
        low.1.await.unwrap().unwrap();
        pool.shutdown().await.unwrap();
    }
}
