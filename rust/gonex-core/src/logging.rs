//! Logging initialization.
//!
//! The runtime logs through `tracing`; nothing installs a subscriber
//! implicitly. Call [`init_logging`] once at process start, or install your
//! own subscriber before touching the runtime.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a formatted `tracing` subscriber filtered by `RUST_LOG`
/// (default `info`). Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    init_logging_with("info");
}

/// Install a formatted subscriber with an explicit default filter, still
/// overridable by `RUST_LOG`.
pub fn init_logging_with(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    // try_init so embedding applications keep their own subscriber
    let _ = fmt().with_env_filter(filter).try_init();
}
