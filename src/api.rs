//! Factory constructors and the process-wide runtime facade.
//!
//! Every factory validates its options before constructing anything. The
//! facade functions (`spawn_fn`, `initialize_parallel`, …) forward to one
//! lazily constructed [`Runtime`]; embedders that want several isolated
//! runtimes construct [`Runtime`] values directly instead.

use std::future::Future;
use std::sync::OnceLock;

use gonex_core::{
    validate_buffer_size, validate_permits, validate_timeout, GonexResult, Timeout,
};
use gonex_runtime::{ParallelConfig, Runtime, TaskHandle, TaskOptions, TaskValue};
use gonex_sync::{
    Channel, ChannelOptions, Mutex, MutexOptions, Once, RWMutex, RWMutexOptions, Semaphore,
    SemaphoreOptions, Ticker, TickerOptions, Timer, WaitGroup,
};

/// A channel with the given capacity (0 = rendezvous).
pub fn channel<T: Send + 'static>(capacity: usize) -> GonexResult<Channel<T>> {
    validate_buffer_size(capacity as i64)?;
    Ok(Channel::bounded(capacity))
}

/// A channel with explicit options.
pub fn channel_with<T: Send + 'static>(options: ChannelOptions) -> GonexResult<Channel<T>> {
    validate_buffer_size(options.capacity as i64)?;
    validate_timeout(options.default_timeout.as_millis())?;
    Ok(Channel::with_options(options))
}

/// A binary mutex with default options.
pub fn mutex() -> Mutex {
    Mutex::new()
}

/// A binary mutex with explicit options.
pub fn mutex_with(options: MutexOptions) -> GonexResult<Mutex> {
    validate_timeout(options.default_timeout.as_millis())?;
    Ok(Mutex::with_options(options))
}

/// A reader-writer mutex with default options.
pub fn rw_mutex() -> RWMutex {
    RWMutex::new()
}

/// A reader-writer mutex with explicit options.
pub fn rw_mutex_with(options: RWMutexOptions) -> GonexResult<RWMutex> {
    validate_timeout(options.default_timeout.as_millis())?;
    Ok(RWMutex::with_options(options))
}

/// A counting semaphore with `permits` permits.
pub fn semaphore(permits: usize) -> GonexResult<Semaphore> {
    validate_permits(permits as i64)?;
    Semaphore::new(permits)
}

/// A counting semaphore with explicit options.
pub fn semaphore_with(options: SemaphoreOptions) -> GonexResult<Semaphore> {
    validate_timeout(options.default_timeout.as_millis())?;
    Semaphore::with_options(options)
}

/// A wait group with a zero counter.
pub fn wait_group() -> WaitGroup {
    WaitGroup::new()
}

/// A one-shot initialization latch.
pub fn once() -> Once {
    Once::new()
}

/// A started ticker delivering tick counts every `interval_ms`.
pub fn ticker(interval_ms: u64) -> GonexResult<Ticker> {
    Ticker::new(interval_ms)
}

/// A ticker with explicit options.
pub fn ticker_with(options: TickerOptions) -> GonexResult<Ticker> {
    Ticker::with_options(options)
}

/// An armed one-shot timer firing after `duration_ms`.
pub fn timer(duration_ms: u64) -> Timer {
    Timer::new(duration_ms)
}

/// A channel delivering one timestamp after `ms` milliseconds.
pub fn after(ms: u64) -> Channel<i64> {
    gonex_sync::time::after(ms)
}

pub use gonex_sync::time::{sleep, sleep_until, sleep_with_backoff, sleep_with_jitter};

/// Spawn a future on the cooperative backend.
pub fn spawn<F, T>(future: F, options: TaskOptions) -> TaskHandle<T>
where
    F: Future<Output = GonexResult<T>> + Send + 'static,
    T: Send + 'static,
{
    gonex_runtime::spawn(future, options)
}

/// Spawn every future and collect the results in spawn order.
pub async fn spawn_all<F, T>(futures: Vec<F>, options: TaskOptions) -> Vec<GonexResult<T>>
where
    F: Future<Output = GonexResult<T>> + Send + 'static,
    T: Send + 'static,
{
    gonex_runtime::spawn_all(futures, options).await
}

/// Receive from a channel with its default timeout.
pub async fn receive<T: Send + 'static>(ch: &Channel<T>) -> GonexResult<Option<T>> {
    ch.receive().await
}

/// Send into a channel with its default timeout.
pub async fn send<T: Send + 'static>(ch: &Channel<T>, value: T) -> GonexResult<()> {
    ch.send(value).await
}

static GLOBAL_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process-wide runtime behind the facade functions.
pub fn runtime() -> &'static Runtime {
    GLOBAL_RUNTIME.get_or_init(Runtime::new)
}

/// Register a callable on the process-wide function registry.
pub fn register_function<F>(id: impl Into<String>, f: F)
where
    F: Fn(&gonex_runtime::WorkerEnv, Vec<TaskValue>) -> GonexResult<TaskValue>
        + Send
        + Sync
        + 'static,
{
    runtime().registry().register(id, f);
}

/// Start the process-wide worker-thread backend.
pub fn initialize_parallel(config: ParallelConfig) -> GonexResult<()> {
    validate_timeout(config.task_timeout.as_millis())?;
    runtime().initialize_parallel(config)
}

/// Drain and stop the process-wide worker-thread backend.
pub async fn shutdown_parallel() {
    runtime().shutdown_parallel().await;
}

/// Spawn a registered function on the process-wide runtime.
pub fn spawn_fn(
    function_id: &str,
    args: Vec<TaskValue>,
    options: TaskOptions,
) -> GonexResult<TaskHandle<TaskValue>> {
    runtime().spawn_fn(function_id, args, options)
}

/// Spawn a registered function on the worker-thread backend.
pub fn spawn_parallel(
    function_id: &str,
    args: Vec<TaskValue>,
) -> GonexResult<TaskHandle<TaskValue>> {
    runtime().spawn_fn(
        function_id,
        args,
        TaskOptions {
            parallel: true,
            ..TaskOptions::default()
        },
    )
}

/// `Background`: the root context.
pub fn background() -> gonex_sync::Context {
    gonex_sync::context::background()
}

pub use gonex_sync::context::{with_cancel, with_deadline, with_timeout, with_value};

/// A validated [`Timeout`] from raw milliseconds (`-1` = infinite).
pub fn timeout_ms(ms: i64) -> GonexResult<Timeout> {
    Timeout::from_millis(ms)
}
