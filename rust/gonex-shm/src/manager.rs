//! Named pool of shared buffers with worker-association tracking and LRU
//! eviction.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use tracing::warn;

use gonex_core::{GonexError, GonexResult};

use crate::buffer::{BufferFlags, SharedMemoryBuffer, HEADER_SIZE};

/// Options accepted by [`SharedMemoryManager::with_options`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Total byte budget (headers included) before LRU eviction kicks in.
    pub max_total_bytes: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_total_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub buffer_count: usize,
    pub total_bytes: usize,
    pub evictions: u64,
}

struct Entry {
    buffer: Arc<SharedMemoryBuffer>,
    last_access: PlMutex<Instant>,
    workers: PlMutex<HashSet<usize>>,
}

/// The named buffer pool. Cloning shares the pool.
#[derive(Clone)]
pub struct SharedMemoryManager {
    entries: Arc<DashMap<String, Arc<Entry>>>,
    max_total_bytes: usize,
    evictions: Arc<AtomicU64>,
}

impl SharedMemoryManager {
    pub fn new() -> Self {
        Self::with_options(ManagerOptions::default())
    }

    pub fn with_options(options: ManagerOptions) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_total_bytes: options.max_total_bytes,
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocate a named buffer. Fails if the name is taken.
    pub fn create(
        &self,
        name: &str,
        size: usize,
        flags: BufferFlags,
    ) -> GonexResult<Arc<SharedMemoryBuffer>> {
        if self.entries.contains_key(name) {
            return Err(GonexError::BufferExists {
                name: name.to_string(),
            });
        }
        let buffer = Arc::new(SharedMemoryBuffer::allocate(size, flags));
        self.insert(name, buffer.clone());
        Ok(buffer)
    }

    /// Attach a snapshot region under a name, validating its header.
    pub fn attach(&self, name: &str, region: Vec<u8>) -> GonexResult<Arc<SharedMemoryBuffer>> {
        if self.entries.contains_key(name) {
            return Err(GonexError::BufferExists {
                name: name.to_string(),
            });
        }
        let buffer = Arc::new(SharedMemoryBuffer::attach(region)?);
        self.insert(name, buffer.clone());
        Ok(buffer)
    }

    /// Look up a buffer, refreshing its LRU position.
    pub fn get(&self, name: &str) -> GonexResult<Arc<SharedMemoryBuffer>> {
        match self.entries.get(name) {
            Some(entry) => {
                *entry.last_access.lock() = Instant::now();
                Ok(entry.buffer.clone())
            }
            None => Err(GonexError::BufferNotFound {
                name: name.to_string(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Drop a buffer from the pool. Outstanding `Arc`s keep the region
    /// alive until released.
    pub fn remove(&self, name: &str) -> GonexResult<()> {
        match self.entries.remove(name) {
            Some(_) => Ok(()),
            None => Err(GonexError::BufferNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Record that a worker references the named buffer. Associated buffers
    /// are exempt from eviction.
    pub fn associate_worker(&self, name: &str, worker_id: usize) -> GonexResult<()> {
        match self.entries.get(name) {
            Some(entry) => {
                entry.workers.lock().insert(worker_id);
                Ok(())
            }
            None => Err(GonexError::BufferNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Drop a worker's association with the named buffer.
    pub fn dissociate_worker(&self, name: &str, worker_id: usize) {
        if let Some(entry) = self.entries.get(name) {
            entry.workers.lock().remove(&worker_id);
        }
    }

    /// Drop every association held by a worker (worker death / shutdown).
    pub fn dissociate_worker_everywhere(&self, worker_id: usize) {
        for entry in self.entries.iter() {
            entry.workers.lock().remove(&worker_id);
        }
    }

    /// Workers currently associated with the named buffer.
    pub fn associations(&self, name: &str) -> Vec<usize> {
        match self.entries.get(name) {
            Some(entry) => {
                let mut ids: Vec<usize> = entry.workers.lock().iter().copied().collect();
                ids.sort_unstable();
                ids
            }
            None => Vec::new(),
        }
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            buffer_count: self.entries.len(),
            total_bytes: self.total_bytes(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn insert(&self, name: &str, buffer: Arc<SharedMemoryBuffer>) {
        self.entries.insert(
            name.to_string(),
            Arc::new(Entry {
                buffer,
                last_access: PlMutex::new(Instant::now()),
                workers: PlMutex::new(HashSet::new()),
            }),
        );
        self.evict_to_budget();
    }

    fn total_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.buffer.size() + HEADER_SIZE)
            .sum()
    }

    /// Evict least-recently-accessed, unassociated buffers until the pool
    /// fits its budget. Buffers a worker still references are never evicted.
    fn evict_to_budget(&self) {
        while self.total_bytes() > self.max_total_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|e| e.workers.lock().is_empty())
                .min_by_key(|e| *e.last_access.lock())
                .map(|e| e.key().clone());
            let Some(name) = victim else {
                warn!(
                    total_bytes = self.total_bytes(),
                    budget = self.max_total_bytes,
                    "buffer pool over budget but every buffer is worker-associated"
                );
                return;
            };
            self.entries.remove(&name);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            warn!(buffer = %name, "evicted least-recently-used shared buffer");
        }
    }
}

impl Default for SharedMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}
