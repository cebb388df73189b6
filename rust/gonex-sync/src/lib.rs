//! Go-style synchronization primitives for the gonex runtime.
//!
//! Everything here is async and cooperative: operations suspend at await
//! points and never block the thread. Waiters on every primitive are strictly
//! FIFO, every blocking operation takes a timeout (with `-1` meaning
//! infinite), and all send/receive/lock futures are cancel-safe. Dropping
//! one unregisters its waiter, which is what lets `select` race cases
//! against each other.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod channel;
pub mod context;
pub mod mutex;
pub mod once;
pub mod rwmutex;
pub mod select;
pub mod semaphore;
pub mod time;
pub mod waitgroup;

pub(crate) mod waiter;

pub use channel::{Channel, ChannelOptions};
pub use context::{background, with_cancel, with_deadline, with_timeout, with_value, Canceler, Context};
pub use mutex::{Mutex, MutexOptions};
pub use once::Once;
pub use rwmutex::{RWMutex, RWMutexOptions, RWMutexState};
pub use select::{
    recv_case, select, select_with_default, select_with_timeout, SelectCase, SelectOptions,
    send_case,
};
pub use semaphore::{Semaphore, SemaphoreOptions};
pub use time::{
    after, sleep, sleep_until, sleep_with_backoff, sleep_with_jitter, Ticker, TickerOptions, Timer,
};
pub use waitgroup::WaitGroup;
