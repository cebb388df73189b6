//! Task runtime: spawn, two scheduler backends, and the worker boundary.
//!
//! The cooperative backend runs futures on the async executor with task
//! bookkeeping (states, timeouts, error hooks). The parallel backend ships
//! registered functions to a fixed pool of OS worker threads: arguments
//! cross the boundary as [`TaskValue`] variants, and synchronization
//! handles arrive on the worker as proxies backed by shared-memory state.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod cooperative;
pub mod marshal;
pub mod parallel;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod task;
pub mod worker;

pub use cooperative::{spawn, spawn_all};
pub use marshal::{ChannelHandle, ContextSnapshot, SyncHandle, TaskValue};
pub use parallel::{ParallelConfig, WorkerPool};
pub use proxy::{worker_select, ChannelProxy, ContextProxy, MutexProxy, SemaphoreProxy, WorkerSelectCase};
pub use registry::{FunctionRegistry, TaskFn};
pub use runtime::Runtime;
pub use task::{TaskHandle, TaskOptions, TaskState};
pub use worker::{WorkerEnv, WorkerState};
