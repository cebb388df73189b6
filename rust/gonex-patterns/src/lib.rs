//! Lifecycle and metrics scaffolding for larger gonex components.
//!
//! A [`Pattern`] is a named, startable component with bounded concurrency,
//! retries with exponential backoff, and operation metrics. The
//! [`PatternRegistry`] tracks named instances and reports aggregate health.
//! The worker-pool skeleton provides a priority queue, autoscaling, and a
//! pluggable load balancer; concrete pools plug in worker creation and
//! task execution.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod pattern;
pub mod registry;
pub mod worker_pool;

pub use pattern::{Pattern, PatternBase, PatternConfig, PatternMetrics, PatternMetricsSnapshot};
pub use registry::{HealthStatus, PatternRegistry, RegistryReport};
pub use worker_pool::{
    LeastLoadedBalancer, LoadBalancer, PoolBackend, PoolConfig, RoundRobinBalancer,
    WorkerPoolSkeleton,
};
