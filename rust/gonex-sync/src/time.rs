//! Tickers, timers, and sleep helpers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as PlMutex;
use rand::Rng;
use tokio::time::Instant;

use gonex_core::{GonexError, GonexResult, Timeout};

use crate::channel::{Channel, ChannelOptions};

/// Suspend the current task for `ms` milliseconds.
pub async fn sleep(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Suspend until `deadline`. Past deadlines return immediately.
pub async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
}

/// Exponential backoff sleep: `initial_ms * 2^attempt` capped at `max_ms`.
/// Returns the delay actually slept.
pub async fn sleep_with_backoff(attempt: u32, initial_ms: u64, max_ms: u64) -> u64 {
    let factor = 2u64.saturating_pow(attempt);
    let delay = initial_ms.saturating_mul(factor).min(max_ms);
    sleep(delay).await;
    delay
}

/// Sleep `base_ms` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
/// Returns the delay actually slept.
pub async fn sleep_with_jitter(base_ms: u64, jitter: f64) -> u64 {
    let jitter = jitter.clamp(0.0, 1.0);
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    let delay = (base_ms as f64 * factor).round().max(0.0) as u64;
    sleep(delay).await;
    delay
}

/// A channel that delivers one wall-clock timestamp (ms since the epoch)
/// after `ms` milliseconds.
pub fn after(ms: u64) -> Channel<i64> {
    let ch: Channel<i64> = Channel::bounded(1);
    let tx = ch.clone();
    tokio::spawn(async move {
        sleep(ms).await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let _ = tx.try_send(now);
    });
    ch
}

/// Options accepted by [`Ticker::with_options`].
#[derive(Debug, Clone)]
pub struct TickerOptions {
    /// Delivery interval in milliseconds.
    pub interval_ms: u64,
    /// Capacity of the owned tick channel; ticks are dropped when it is
    /// full and no receiver keeps up.
    pub buffer: usize,
    pub name: Option<String>,
}

impl Default for TickerOptions {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            buffer: 1,
            name: None,
        }
    }
}

struct TickerInner {
    ch: Channel<u64>,
    interval: PlMutex<Duration>,
    running: AtomicBool,
    count: AtomicU64,
    task: PlMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for TickerInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Delivers an increasing tick count into an owned channel at a fixed
/// interval. Started on construction.
#[derive(Clone)]
pub struct Ticker {
    inner: Arc<TickerInner>,
}

impl Ticker {
    pub fn new(interval_ms: u64) -> GonexResult<Self> {
        Self::with_options(TickerOptions {
            interval_ms,
            ..TickerOptions::default()
        })
    }

    pub fn with_options(options: TickerOptions) -> GonexResult<Self> {
        if options.interval_ms == 0 {
            return Err(GonexError::InvalidTimeout { value: 0 });
        }
        let ticker = Ticker {
            inner: Arc::new(TickerInner {
                ch: Channel::with_options(ChannelOptions {
                    capacity: options.buffer.max(1),
                    default_timeout: Timeout::INFINITE,
                    name: options.name,
                }),
                interval: PlMutex::new(Duration::from_millis(options.interval_ms)),
                running: AtomicBool::new(true),
                count: AtomicU64::new(0),
                task: PlMutex::new(None),
            }),
        };
        ticker.spawn_loop();
        Ok(ticker)
    }

    /// The channel ticks are delivered into.
    pub fn channel(&self) -> Channel<u64> {
        self.inner.ch.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Ticks delivered (or dropped) so far.
    pub fn tick_count(&self) -> u64 {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Stop delivering ticks. Idempotent; the tick channel stays open.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }

    /// Change the interval. A running ticker restarts on the new cadence;
    /// a stopped one keeps the interval for a later start.
    pub fn set_interval(&self, interval_ms: u64) -> GonexResult<()> {
        if interval_ms == 0 {
            return Err(GonexError::InvalidTimeout { value: 0 });
        }
        *self.inner.interval.lock() = Duration::from_millis(interval_ms);
        if self.is_running() {
            if let Some(task) = self.inner.task.lock().take() {
                task.abort();
            }
            self.spawn_loop();
        }
        Ok(())
    }

    /// Resume a stopped ticker on the current interval.
    pub fn start(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.spawn_loop();
        }
    }

    fn spawn_loop(&self) {
        // The loop holds only a weak reference; dropping the last Ticker
        // clone tears it down.
        let weak: Weak<TickerInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else { return };
                if !inner.running.load(Ordering::SeqCst) {
                    return;
                }
                let interval = *inner.interval.lock();
                drop(inner);
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                if !inner.running.load(Ordering::SeqCst) {
                    return;
                }
                let n = inner.count.fetch_add(1, Ordering::SeqCst) + 1;
                // A full channel drops the tick rather than stalling the loop.
                let _ = inner.ch.try_send(n);
            }
        });
        *self.inner.task.lock() = Some(task);
    }
}

struct TimerInner {
    ch: Channel<()>,
    fired: AtomicBool,
    stopped: AtomicBool,
    task: PlMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Resolves once after a duration; can be stopped and reset.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Arm a timer firing after `duration_ms`.
    pub fn new(duration_ms: u64) -> Self {
        let timer = Timer {
            inner: Arc::new(TimerInner {
                ch: Channel::with_options(ChannelOptions {
                    capacity: 1,
                    default_timeout: Timeout::INFINITE,
                    name: None,
                }),
                fired: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                task: PlMutex::new(None),
            }),
        };
        timer.arm(duration_ms);
        timer
    }

    /// Wait for the firing. `Ok(true)` when fired, `Ok(false)` when the
    /// timer was stopped first.
    pub async fn wait(&self) -> GonexResult<bool> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match self.inner.ch.receive_timeout(Timeout::INFINITE).await? {
            Some(()) => Ok(true),
            None => Ok(false),
        }
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Cancel a pending firing. Returns `true` when stopped before it
    /// fired. Waiters observe the stop.
    pub fn stop(&self) -> bool {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        let before_fire = !self.inner.fired.load(Ordering::SeqCst);
        self.inner.ch.close();
        before_fire
    }

    /// Re-arm with a new duration. Returns `true` when the previous firing
    /// was still pending. A stopped timer cannot be reset.
    pub fn reset(&self, duration_ms: u64) -> bool {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let pending = {
            let mut task = self.inner.task.lock();
            match task.take() {
                Some(t) => {
                    t.abort();
                    true
                }
                None => false,
            }
        };
        self.inner.fired.store(false, Ordering::SeqCst);
        // Discard a tick the old firing may have parked in the channel.
        let _ = self.inner.ch.try_receive();
        self.arm(duration_ms);
        pending && !self.has_fired()
    }

    fn arm(&self, duration_ms: u64) {
        let weak: Weak<TimerInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            if let Some(inner) = weak.upgrade() {
                inner.fired.store(true, Ordering::SeqCst);
                let _ = inner.ch.try_send(());
                inner.task.lock().take();
            }
        });
        *self.inner.task.lock() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_is_at_least_duration() {
        let start = Instant::now();
        sleep(30).await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        assert_eq!(sleep_with_backoff(0, 1, 100).await, 1);
        assert_eq!(sleep_with_backoff(3, 1, 100).await, 8);
        assert_eq!(sleep_with_backoff(20, 1, 100).await, 100);
    }

    #[tokio::test]
    async fn test_jitter_stays_in_band() {
        let slept = sleep_with_jitter(20, 0.5).await;
        assert!((10..=30).contains(&slept), "slept {slept}ms");
    }

    #[tokio::test]
    async fn test_after_delivers_one_timestamp() {
        let ch = after(20);
        let ts = ch
            .receive_timeout(Timeout::from_millis(1000).unwrap())
            .await
            .unwrap();
        assert!(ts.is_some());
        assert!(ts.unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn test_ticker_delivers_increasing_counts() {
        let ticker = Ticker::with_options(TickerOptions {
            interval_ms: 15,
            buffer: 16,
            name: None,
        })
        .unwrap();
        let ch = ticker.channel();
        let a = ch.receive_timeout(Timeout::from_millis(1000).unwrap()).await.unwrap();
        let b = ch.receive_timeout(Timeout::from_millis(1000).unwrap()).await.unwrap();
        ticker.stop();
        assert_eq!(a, Some(1));
        assert_eq!(b, Some(2));
        assert!(!ticker.is_running());
    }

    #[tokio::test]
    async fn test_ticker_stop_halts_delivery() {
        let ticker = Ticker::new(10).unwrap();
        let ch = ticker.channel();
        let _ = ch.receive_timeout(Timeout::from_millis(1000).unwrap()).await;
        ticker.stop();
        let count = ticker.tick_count();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticker.tick_count(), count);
    }

    #[tokio::test]
    async fn test_ticker_set_interval_restarts_running() {
        let ticker = Ticker::new(10_000).unwrap();
        // Shrinking the interval while running reschedules the next tick.
        ticker.set_interval(10).unwrap();
        let tick = ticker
            .channel()
            .receive_timeout(Timeout::from_millis(1000).unwrap())
            .await
            .unwrap();
        ticker.stop();
        assert_eq!(tick, Some(1));
        assert!(!ticker.is_running());
    }

    #[tokio::test]
    async fn test_ticker_zero_interval_rejected() {
        assert!(Ticker::new(0).is_err());
    }

    #[tokio::test]
    async fn test_timer_fires_once() {
        let timer = Timer::new(20);
        assert!(timer.wait().await.unwrap());
        assert!(timer.has_fired());
    }

    #[tokio::test]
    async fn test_timer_stop_before_fire() {
        let timer = Timer::new(10_000);
        assert!(timer.stop());
        assert!(!timer.wait().await.unwrap());
        assert!(!timer.has_fired());
    }

    #[tokio::test]
    async fn test_timer_reset_reschedules() {
        let timer = Timer::new(10_000);
        assert!(timer.reset(20));
        assert!(timer.wait().await.unwrap());
    }
}
