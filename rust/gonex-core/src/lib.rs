//! Low-level utilities shared by every gonex crate.
//!
//! This crate carries the pieces everything else leans on: the error
//! taxonomy, the millisecond timeout type with its `-1` infinite sentinel,
//! boundary validation, a fixed-capacity circular queue, and logging setup.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod constants;
pub mod error;
pub mod logging;
pub mod queue;
pub mod timeout;
pub mod validate;

pub use constants::*;
pub use error::{ErrorKind, GonexError, GonexResult};
pub use logging::init_logging;
pub use queue::CircularQueue;
pub use timeout::Timeout;
pub use validate::{validate_buffer_size, validate_concurrency, validate_permits, validate_timeout};
