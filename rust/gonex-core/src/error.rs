//! Error types for the gonex runtime.

use thiserror::Error;

/// Result type for gonex operations
pub type GonexResult<T> = Result<T, GonexError>;

/// Stable machine-readable tag for an error. Callers branch on this rather
/// than matching display strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ChannelClosed,
    ChannelTimeout,
    ChannelBufferFull,
    ContextCancelled,
    ContextTimeout,
    ContextDeadlineExceeded,
    MutexLockTimeout,
    MutexAlreadyLocked,
    MutexNotLocked,
    RWMutexReadLockTimeout,
    RWMutexWriteLockTimeout,
    RWMutexNotReadLocked,
    RWMutexNotWriteLocked,
    RWMutexTooManyReaders,
    WaitGroupNegativeCounter,
    WaitGroupTimeout,
    SemaphoreTimeout,
    OnceFailed,
    InvalidTimeout,
    InvalidBufferSize,
    InvalidConcurrency,
    TaskFailed,
    TaskTimeout,
    WorkerFailed,
    FunctionNotRegistered,
    MarshalUnsupported,
    ProxyUnsupported,
    SerializationFailed,
    BufferNotFound,
    BufferExists,
    InvalidHeader,
    ChecksumMismatch,
    ReadOnlyBuffer,
    OutOfBounds,
    QueueFull,
    QueueEmpty,
    MapFull,
    Aggregate,
    Internal,
}

/// Comprehensive error type for the gonex runtime
#[derive(Error, Debug, Clone)]
pub enum GonexError {
    /// Send or receive on a closed channel
    #[error("channel{} is closed", fmt_name(.name))]
    ChannelClosed { name: Option<String> },

    /// Channel operation exceeded its deadline
    #[error("channel operation timed out after {timeout_ms}ms")]
    ChannelTimeout { timeout_ms: i64 },

    /// Non-blocking send into a full buffer
    #[error("channel buffer full (capacity {capacity})")]
    ChannelBufferFull { capacity: usize },

    /// Context cancelled explicitly
    #[error("context cancelled")]
    ContextCancelled,

    /// Context cancelled by its timeout
    #[error("context timed out after {timeout_ms}ms")]
    ContextTimeout { timeout_ms: i64 },

    /// Context cancelled by its deadline
    #[error("context deadline exceeded")]
    ContextDeadlineExceeded,

    /// Mutex acquisition exceeded its deadline
    #[error("mutex{} lock timed out after {timeout_ms}ms", fmt_name(.name))]
    MutexLockTimeout { name: Option<String>, timeout_ms: i64 },

    /// try_lock on a held mutex
    #[error("mutex is already locked")]
    MutexAlreadyLocked,

    /// Unlock of a mutex that is not held
    #[error("mutex is not locked")]
    MutexNotLocked,

    /// Read-lock acquisition exceeded its deadline
    #[error("rwmutex read lock timed out after {timeout_ms}ms")]
    RWMutexReadLockTimeout { timeout_ms: i64 },

    /// Write-lock acquisition exceeded its deadline
    #[error("rwmutex write lock timed out after {timeout_ms}ms")]
    RWMutexWriteLockTimeout { timeout_ms: i64 },

    /// Read-unlock with no read lock held
    #[error("rwmutex is not read locked")]
    RWMutexNotReadLocked,

    /// Write-unlock with no write lock held
    #[error("rwmutex is not write locked")]
    RWMutexNotWriteLocked,

    /// Reader count would exceed the configured cap
    #[error("rwmutex reader limit reached (max {max_readers})")]
    RWMutexTooManyReaders { max_readers: usize },

    /// `add` would drive the wait group counter below zero
    #[error("wait group counter cannot go negative (counter {counter}, delta {delta})")]
    WaitGroupNegativeCounter { counter: i64, delta: i64 },

    /// `wait` on a wait group exceeded its deadline
    #[error("wait group wait timed out after {timeout_ms}ms")]
    WaitGroupTimeout { timeout_ms: i64 },

    /// Semaphore acquisition exceeded its deadline
    #[error("semaphore acquire timed out after {timeout_ms}ms")]
    SemaphoreTimeout { timeout_ms: i64 },

    /// The initializer passed to `Once::call` failed
    #[error("once initializer failed: {message}")]
    OnceFailed { message: String },

    /// Timeout outside `[-1, MAX_TIMEOUT]`
    #[error("invalid timeout: {value}ms")]
    InvalidTimeout { value: i64 },

    /// Buffer size outside the permitted range
    #[error("invalid buffer size: {value}")]
    InvalidBufferSize { value: i64 },

    /// Concurrency level outside the permitted range
    #[error("invalid concurrency: {value}")]
    InvalidConcurrency { value: i64 },

    /// Task body returned an error
    #[error("task{} failed: {message}", fmt_name(.name))]
    TaskFailed { name: Option<String>, message: String },

    /// Task exceeded its per-call timeout
    #[error("task{} timed out after {timeout_ms}ms", fmt_name(.name))]
    TaskTimeout { name: Option<String>, timeout_ms: i64 },

    /// A worker thread died or panicked
    #[error("worker {worker_id} failed: {message}")]
    WorkerFailed { worker_id: usize, message: String },

    /// Parallel spawn of a callable the registry does not know
    #[error("function '{id}' is not registered")]
    FunctionNotRegistered { id: String },

    /// Argument cannot cross the worker boundary
    #[error("cannot marshal {type_name} across worker boundary")]
    MarshalUnsupported { type_name: String },

    /// Operation not expressible on a worker-side proxy
    #[error("{operation} is not supported across worker boundaries")]
    ProxyUnsupported { operation: String },

    /// bincode / serde failure while marshaling
    #[error("serialization failed: {message}")]
    SerializationFailed { message: String },

    /// Named buffer missing from the shared-memory manager
    #[error("shared buffer '{name}' not found")]
    BufferNotFound { name: String },

    /// Named buffer already present in the shared-memory manager
    #[error("shared buffer '{name}' already exists")]
    BufferExists { name: String },

    /// Shared buffer header failed validation
    #[error("invalid shared buffer header: {reason}")]
    InvalidHeader { reason: String },

    /// Stored checksum does not match the payload
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Mutation of a READ_ONLY buffer
    #[error("buffer is read-only")]
    ReadOnlyBuffer,

    /// Read or write past the end of a buffer region
    #[error("out of bounds: offset {offset} + len {len} > size {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    /// Non-blocking enqueue into a full queue
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Non-blocking dequeue from an empty queue
    #[error("queue is empty")]
    QueueEmpty,

    /// Insert into a map at its capacity limit
    #[error("map is full (capacity {capacity})")]
    MapFull { capacity: usize },

    /// Several failures reported together (wait groups, pattern batches)
    #[error("{} errors: [{}]", .errors.len(), fmt_errors(.errors))]
    Aggregate { errors: Vec<GonexError> },

    /// Invariant violation inside the runtime
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GonexError {
    /// The stable kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GonexError::ChannelClosed { .. } => ErrorKind::ChannelClosed,
            GonexError::ChannelTimeout { .. } => ErrorKind::ChannelTimeout,
            GonexError::ChannelBufferFull { .. } => ErrorKind::ChannelBufferFull,
            GonexError::ContextCancelled => ErrorKind::ContextCancelled,
            GonexError::ContextTimeout { .. } => ErrorKind::ContextTimeout,
            GonexError::ContextDeadlineExceeded => ErrorKind::ContextDeadlineExceeded,
            GonexError::MutexLockTimeout { .. } => ErrorKind::MutexLockTimeout,
            GonexError::MutexAlreadyLocked => ErrorKind::MutexAlreadyLocked,
            GonexError::MutexNotLocked => ErrorKind::MutexNotLocked,
            GonexError::RWMutexReadLockTimeout { .. } => ErrorKind::RWMutexReadLockTimeout,
            GonexError::RWMutexWriteLockTimeout { .. } => ErrorKind::RWMutexWriteLockTimeout,
            GonexError::RWMutexNotReadLocked => ErrorKind::RWMutexNotReadLocked,
            GonexError::RWMutexNotWriteLocked => ErrorKind::RWMutexNotWriteLocked,
            GonexError::RWMutexTooManyReaders { .. } => ErrorKind::RWMutexTooManyReaders,
            GonexError::WaitGroupNegativeCounter { .. } => ErrorKind::WaitGroupNegativeCounter,
            GonexError::WaitGroupTimeout { .. } => ErrorKind::WaitGroupTimeout,
            GonexError::SemaphoreTimeout { .. } => ErrorKind::SemaphoreTimeout,
            GonexError::OnceFailed { .. } => ErrorKind::OnceFailed,
            GonexError::InvalidTimeout { .. } => ErrorKind::InvalidTimeout,
            GonexError::InvalidBufferSize { .. } => ErrorKind::InvalidBufferSize,
            GonexError::InvalidConcurrency { .. } => ErrorKind::InvalidConcurrency,
            GonexError::TaskFailed { .. } => ErrorKind::TaskFailed,
            GonexError::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            GonexError::WorkerFailed { .. } => ErrorKind::WorkerFailed,
            GonexError::FunctionNotRegistered { .. } => ErrorKind::FunctionNotRegistered,
            GonexError::MarshalUnsupported { .. } => ErrorKind::MarshalUnsupported,
            GonexError::ProxyUnsupported { .. } => ErrorKind::ProxyUnsupported,
            GonexError::SerializationFailed { .. } => ErrorKind::SerializationFailed,
            GonexError::BufferNotFound { .. } => ErrorKind::BufferNotFound,
            GonexError::BufferExists { .. } => ErrorKind::BufferExists,
            GonexError::InvalidHeader { .. } => ErrorKind::InvalidHeader,
            GonexError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            GonexError::ReadOnlyBuffer => ErrorKind::ReadOnlyBuffer,
            GonexError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            GonexError::QueueFull { .. } => ErrorKind::QueueFull,
            GonexError::QueueEmpty => ErrorKind::QueueEmpty,
            GonexError::MapFull { .. } => ErrorKind::MapFull,
            GonexError::Aggregate { .. } => ErrorKind::Aggregate,
            GonexError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Collapse a batch of errors: empty → `None`, one → unwrapped,
    /// several → `Aggregate`.
    pub fn aggregate(mut errors: Vec<GonexError>) -> Option<GonexError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(GonexError::Aggregate { errors }),
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ChannelTimeout
                | ErrorKind::ChannelBufferFull
                | ErrorKind::MutexLockTimeout
                | ErrorKind::RWMutexReadLockTimeout
                | ErrorKind::RWMutexWriteLockTimeout
                | ErrorKind::WaitGroupTimeout
                | ErrorKind::SemaphoreTimeout
                | ErrorKind::TaskTimeout
                | ErrorKind::QueueFull
                | ErrorKind::QueueEmpty
        )
    }
}

fn fmt_name(name: &Option<String>) -> String {
    match name {
        Some(n) => format!(" '{n}'"),
        None => String::new(),
    }
}

fn fmt_errors(errors: &[GonexError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
