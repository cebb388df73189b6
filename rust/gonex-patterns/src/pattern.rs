//! Pattern base: lifecycle, bounded concurrency, retry, and metrics.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use gonex_core::{GonexError, GonexResult, Timeout};
use gonex_sync::Semaphore;

/// Configuration shared by every pattern.
#[derive(Debug, Clone)]
pub struct PatternConfig {
    pub name: String,
    /// Concurrent operations admitted at once.
    pub max_concurrency: usize,
    /// Per-operation deadline.
    pub timeout: Timeout,
    /// Retries after the first attempt; only transient errors retry.
    pub retry_attempts: u32,
    /// First backoff delay in milliseconds; doubles per attempt.
    pub retry_initial_ms: u64,
    /// Backoff cap in milliseconds.
    pub retry_max_ms: u64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            name: "pattern".to_string(),
            max_concurrency: 16,
            timeout: Timeout::INFINITE,
            retry_attempts: 3,
            retry_initial_ms: 100,
            retry_max_ms: 5_000,
        }
    }
}

/// Operation counters, updated lock-free.
#[derive(Debug, Default)]
pub struct PatternMetrics {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_operations: AtomicU64,
    peak_concurrency: AtomicU64,
    /// ms since the epoch; 0 = never.
    last_operation_ms: AtomicI64,
}

/// Point-in-time view of [`PatternMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMetricsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
    pub active_operations: u64,
    pub peak_concurrency: u64,
    pub last_operation_time_ms: Option<i64>,
}

impl PatternMetrics {
    pub fn snapshot(&self) -> PatternMetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let total_duration = self.total_duration_ms.load(Ordering::Relaxed);
        let last = self.last_operation_ms.load(Ordering::Relaxed);
        PatternMetricsSnapshot {
            total,
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            average_duration_ms: if total > 0 {
                total_duration as f64 / total as f64
            } else {
                0.0
            },
            active_operations: self.active_operations.load(Ordering::Relaxed),
            peak_concurrency: self.peak_concurrency.load(Ordering::Relaxed),
            last_operation_time_ms: if last > 0 { Some(last) } else { None },
        }
    }

    fn operation_started(&self) {
        let active = self.active_operations.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_concurrency.fetch_max(active, Ordering::Relaxed);
    }

    fn operation_finished(&self, ok: bool, duration_ms: u64) {
        self.active_operations.fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.last_operation_ms.store(now, Ordering::Relaxed);
    }
}

/// The lifecycle contract every registered component implements.
#[async_trait]
pub trait Pattern: Send + Sync {
    fn config(&self) -> &PatternConfig;
    fn metrics(&self) -> &PatternMetrics;
    async fn start(&self) -> GonexResult<()>;
    async fn stop(&self) -> GonexResult<()>;
    fn is_running(&self) -> bool;
}

/// Reusable pattern state: running flag, admission semaphore, metrics, and
/// the instrumented retry executor. Concrete patterns embed one.
pub struct PatternBase {
    config: PatternConfig,
    metrics: PatternMetrics,
    running: AtomicBool,
    admission: Semaphore,
}

impl PatternBase {
    pub fn new(config: PatternConfig) -> GonexResult<Self> {
        let admission = Semaphore::new(config.max_concurrency.max(1))?;
        Ok(Self {
            config,
            metrics: PatternMetrics::default(),
            running: AtomicBool::new(false),
            admission,
        })
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PatternMetrics {
        &self.metrics
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run an operation under admission control with retries and metrics.
    /// Only transient failures retry; backoff doubles from
    /// `retry_initial_ms` up to `retry_max_ms`.
    pub async fn execute<F, Fut, T>(&self, mut op: F) -> GonexResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = GonexResult<T>>,
    {
        if !self.is_running() {
            return Err(GonexError::Internal {
                message: format!("pattern '{}' is not running", self.config.name),
            });
        }
        self.admission.acquire_timeout(Timeout::INFINITE).await?;
        self.metrics.operation_started();
        let started = Instant::now();

        let mut attempt: u32 = 0;
        let result = loop {
            let attempt_result = match self.config.timeout.as_duration() {
                Some(d) => match tokio::time::timeout(d, op()).await {
                    Ok(r) => r,
                    Err(_elapsed) => Err(GonexError::TaskTimeout {
                        name: Some(self.config.name.clone()),
                        timeout_ms: self.config.timeout.as_millis(),
                    }),
                },
                None => op().await,
            };
            match attempt_result {
                Ok(v) => break Ok(v),
                Err(e) if e.is_transient() && attempt < self.config.retry_attempts => {
                    let delay = gonex_sync::time::sleep_with_backoff(
                        attempt,
                        self.config.retry_initial_ms,
                        self.config.retry_max_ms,
                    )
                    .await;
                    attempt += 1;
                    debug!(
                        pattern = %self.config.name,
                        attempt,
                        delayed_ms = delay,
                        error = %e,
                        "retrying after transient failure"
                    );
                }
                Err(e) => break Err(e),
            }
        };

        self.metrics
            .operation_finished(result.is_ok(), started.elapsed().as_millis() as u64);
        self.admission.release()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn base(retries: u32) -> PatternBase {
        let b = PatternBase::new(PatternConfig {
            name: "test".to_string(),
            retry_attempts: retries,
            retry_initial_ms: 1,
            retry_max_ms: 4,
            ..PatternConfig::default()
        })
        .expect("base");
        b.start();
        b
    }

    #[tokio::test]
    async fn test_execute_counts_success() {
        let b = base(0);
        let v = b.execute(|| async { Ok(5) }).await.unwrap();
        assert_eq!(v, 5);
        let m = b.metrics().snapshot();
        assert_eq!(m.total, 1);
        assert_eq!(m.successful, 1);
        assert_eq!(m.failed, 0);
        assert_eq!(m.active_operations, 0);
        assert!(m.peak_concurrency >= 1);
        assert!(m.last_operation_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_success() {
        let b = base(5);
        let tries = Arc::new(AtomicUsize::new(0));
        let t = tries.clone();
        let v = b
            .execute(move || {
                let t = t.clone();
                async move {
                    if t.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GonexError::SemaphoreTimeout { timeout_ms: 1 })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(v, "done");
        assert_eq!(tries.load(Ordering::SeqCst), 3);
        // One logical operation despite the retries.
        assert_eq!(b.metrics().snapshot().total, 1);
    }

    #[tokio::test]
    async fn test_contract_errors_do_not_retry() {
        let b = base(5);
        let tries = Arc::new(AtomicUsize::new(0));
        let t = tries.clone();
        let err = b
            .execute(move || {
                let t = t.clone();
                async move {
                    t.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(GonexError::MutexNotLocked)
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), gonex_core::ErrorKind::MutexNotLocked);
        assert_eq!(tries.load(Ordering::SeqCst), 1);
        assert_eq!(b.metrics().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust() {
        let b = base(2);
        let err = b
            .execute(|| async { Err::<(), _>(GonexError::SemaphoreTimeout { timeout_ms: 1 }) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), gonex_core::ErrorKind::SemaphoreTimeout);
    }

    #[tokio::test]
    async fn test_stopped_pattern_rejects() {
        let b = base(0);
        b.stop();
        assert!(b.execute(|| async { Ok(()) }).await.is_err());
    }
}
