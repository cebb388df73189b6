//! Go-style concurrency for Rust: goroutine-like tasks, typed channels,
//! `select`, contexts, and shared-memory primitives for worker threads.
//!
//! The cooperative backend runs tasks on the async executor; the optional
//! parallel backend ships registered functions to OS worker threads, with
//! synchronization handles crossing the boundary as proxies backed by
//! shared-memory state.
//!
//! # Example
//! ```no_run
//! use gonex::{channel, spawn, TaskOptions};
//!
//! async fn example() -> gonex::GonexResult<()> {
//!     let jobs = channel::<i32>(4)?;
//!     let results = channel::<i32>(4)?;
//!
//!     let worker = {
//!         let (jobs, results) = (jobs.clone(), results.clone());
//!         spawn(
//!             async move {
//!                 while let Some(n) = jobs.receive().await? {
//!                     results.send(n * 2).await?;
//!                 }
//!                 Ok(())
//!             },
//!             TaskOptions::default(),
//!         )
//!     };
//!
//!     jobs.send(21).await?;
//!     jobs.close();
//!     assert_eq!(results.receive().await?, Some(42));
//!     worker.join().await
//! }
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod api;

pub use api::*;

// Errors, timeouts, constants, validation.
pub use gonex_core::{
    init_logging, validate_buffer_size, validate_concurrency, validate_timeout, ErrorKind,
    GonexError, GonexResult, Timeout, DEFAULT_CHANNEL_TIMEOUT, DEFAULT_MUTEX_TIMEOUT,
    DEFAULT_SEMAPHORE_TIMEOUT, DEFAULT_TIMEOUT, INFINITE_TIMEOUT, MAX_CHANNEL_BUFFER, MAX_TIMEOUT,
    MAX_WORKER_POOL_SIZE,
};

// Synchronization primitives.
pub use gonex_sync::{
    context, recv_case, select, select_with_default, select_with_timeout, send_case, Canceler,
    Channel, ChannelOptions, Context, Mutex, MutexOptions, Once, RWMutex, RWMutexOptions,
    RWMutexState, SelectCase, SelectOptions, Semaphore, SemaphoreOptions, Ticker, TickerOptions,
    Timer, WaitGroup,
};

// Shared-memory layer.
pub use gonex_shm::{
    AtomicCell, BufferFlags, CellMutex, ConcurrentHashMap, ConcurrentMapStats, ManagerOptions,
    ManagerStats, SegmentStats, SharedChannel, SharedChannelOptions, SharedChannelState,
    SharedMap, SharedMapOptions, SharedMemoryBuffer, SharedMemoryManager, SharedMutex,
    SharedPriorityQueue, SharedQueue, SharedSemaphore,
};

// Task runtime.
pub use gonex_runtime::{
    worker_select, ChannelProxy, ContextProxy, FunctionRegistry, MutexProxy, ParallelConfig,
    Runtime, SemaphoreProxy, TaskHandle, TaskOptions, TaskState, TaskValue, WorkerEnv,
    WorkerSelectCase,
};

// Pattern scaffolding.
pub use gonex_patterns::{
    HealthStatus, LeastLoadedBalancer, LoadBalancer, Pattern, PatternBase, PatternConfig,
    PatternMetrics, PatternMetricsSnapshot, PatternRegistry, PoolBackend, PoolConfig,
    RegistryReport, RoundRobinBalancer, WorkerPoolSkeleton,
};
