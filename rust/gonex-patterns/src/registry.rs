//! Global registry of named patterns with aggregate metrics and health.

use std::sync::Arc;

use dashmap::DashMap;

use gonex_core::{GonexError, GonexResult};

use crate::pattern::{Pattern, PatternMetricsSnapshot};

/// Aggregate condition of the registered patterns, by running ratio:
/// ≥ 80% healthy, ≥ 50% degraded, else unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// What [`PatternRegistry::report`] returns.
#[derive(Debug, Clone)]
pub struct RegistryReport {
    pub health: HealthStatus,
    pub registered: usize,
    pub running: usize,
    pub aggregate: PatternMetricsSnapshot,
}

/// Named pattern instances. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct PatternRegistry {
    patterns: Arc<DashMap<String, Arc<dyn Pattern>>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance under its configured name.
    pub fn register(&self, pattern: Arc<dyn Pattern>) -> GonexResult<()> {
        let name = pattern.config().name.clone();
        if self.patterns.contains_key(&name) {
            return Err(GonexError::Internal {
                message: format!("pattern '{name}' is already registered"),
            });
        }
        self.patterns.insert(name, pattern);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.patterns.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Pattern>> {
        self.patterns.get(name).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.patterns.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop every registered pattern.
    pub async fn stop_all(&self) -> GonexResult<()> {
        let patterns: Vec<Arc<dyn Pattern>> =
            self.patterns.iter().map(|e| e.value().clone()).collect();
        let mut errors = Vec::new();
        for p in patterns {
            if let Err(e) = p.stop().await {
                errors.push(e);
            }
        }
        match GonexError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Aggregate health and metrics across every registered pattern.
    pub fn report(&self) -> RegistryReport {
        let mut registered = 0usize;
        let mut running = 0usize;
        let mut aggregate = PatternMetricsSnapshot {
            total: 0,
            successful: 0,
            failed: 0,
            average_duration_ms: 0.0,
            active_operations: 0,
            peak_concurrency: 0,
            last_operation_time_ms: None,
        };
        let mut weighted_duration = 0.0;
        for entry in self.patterns.iter() {
            registered += 1;
            if entry.is_running() {
                running += 1;
            }
            let m = entry.metrics().snapshot();
            aggregate.total += m.total;
            aggregate.successful += m.successful;
            aggregate.failed += m.failed;
            aggregate.active_operations += m.active_operations;
            aggregate.peak_concurrency = aggregate.peak_concurrency.max(m.peak_concurrency);
            weighted_duration += m.average_duration_ms * m.total as f64;
            aggregate.last_operation_time_ms = match (
                aggregate.last_operation_time_ms,
                m.last_operation_time_ms,
            ) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        if aggregate.total > 0 {
            aggregate.average_duration_ms = weighted_duration / aggregate.total as f64;
        }
        let health = if registered == 0 {
            HealthStatus::Healthy
        } else {
            let ratio = running as f64 / registered as f64;
            if ratio >= 0.8 {
                HealthStatus::Healthy
            } else if ratio >= 0.5 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            }
        };
        RegistryReport {
            health,
            registered,
            running,
            aggregate,
        }
    }
}
