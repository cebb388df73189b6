//! Shared-memory primitives for the gonex runtime.
//!
//! Everything in this crate is shared across OS threads: worker threads and
//! the main thread coordinate exclusively through the atomic cell protocols
//! here. Unlike `gonex-sync`, these primitives block the calling thread;
//! they are built for worker code, not for async tasks.
//!
//! The layer stack, bottom up: [`AtomicCell`] (CAS + park/unpark over a
//! shared integer), [`CellMutex`] (lock protocol over a cell),
//! [`SharedMemoryBuffer`] (header-checksummed byte region),
//! [`SharedMemoryManager`] (named pool with LRU eviction), and the
//! containers built on top of them.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod atomic_cell;
pub mod buffer;
pub mod channel;
pub mod concurrent_map;
pub mod manager;
pub mod map;
pub mod priority_queue;
pub mod queue;
pub mod sync;

pub use atomic_cell::{AtomicCell, CellMutex};
pub use buffer::{BufferFlags, SharedMemoryBuffer, HEADER_SIZE, MAGIC, VERSION};
pub use channel::{SharedChannel, SharedChannelOptions, SharedChannelState};
pub use concurrent_map::{ConcurrentHashMap, ConcurrentMapStats, SegmentStats};
pub use manager::{ManagerOptions, ManagerStats, SharedMemoryManager};
pub use map::{SharedMap, SharedMapOptions};
pub use priority_queue::SharedPriorityQueue;
pub use queue::SharedQueue;
pub use sync::{SharedMutex, SharedSemaphore};
