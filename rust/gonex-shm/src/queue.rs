//! Multi-producer multi-consumer circular queue over shared memory.
//!
//! Header cells: a [`CellMutex`], a condition generation cell, and head /
//! tail / size cells. Fixed-size slots live in a [`SharedMemoryBuffer`];
//! every mutation happens under the cell mutex. Blocking variants park on
//! the generation cell between attempts; non-blocking variants return
//! immediately.

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use gonex_core::{GonexError, GonexResult};

use crate::atomic_cell::{AtomicCell, CellMutex};
use crate::buffer::{BufferFlags, SharedMemoryBuffer};

/// How long a blocked producer/consumer parks before rechecking.
const PARK_SLICE: Duration = Duration::from_millis(10);

/// A bounded MPMC byte queue shared across threads. Values above the
/// per-item limit are rejected at the boundary.
pub struct SharedQueue {
    mutex: CellMutex,
    /// Condition generation: bumped on every successful enqueue/dequeue.
    generation: AtomicCell,
    head: AtomicCell,
    tail: AtomicCell,
    size: AtomicCell,
    capacity: usize,
    max_item_size: usize,
    buffer: SharedMemoryBuffer,
}

impl SharedQueue {
    /// A queue of `capacity` slots, each holding up to `max_item_size`
    /// bytes.
    pub fn new(capacity: usize, max_item_size: usize) -> GonexResult<Self> {
        if capacity == 0 {
            return Err(GonexError::InvalidBufferSize { value: 0 });
        }
        if max_item_size == 0 {
            return Err(GonexError::InvalidBufferSize { value: 0 });
        }
        let slot_size = 4 + max_item_size;
        Ok(Self {
            mutex: CellMutex::new(),
            generation: AtomicCell::new(0),
            head: AtomicCell::new(0),
            tail: AtomicCell::new(0),
            size: AtomicCell::new(0),
            capacity,
            max_item_size,
            buffer: SharedMemoryBuffer::allocate(capacity * slot_size, BufferFlags::empty()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_item_size(&self) -> usize {
        self.max_item_size
    }

    pub fn len(&self) -> usize {
        self.size.load() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Blocking enqueue. `QueueFull` when the deadline passes with the
    /// queue still full; `None` timeout blocks indefinitely.
    pub fn enqueue_bytes(&self, data: &[u8], timeout: Option<Duration>) -> GonexResult<()> {
        self.check_item(data)?;
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let gen_before = {
                self.mutex.lock();
                if (self.size.load() as usize) < self.capacity {
                    let written = self.write_slot(self.tail.load() as usize, data);
                    if written.is_ok() {
                        self.tail
                            .store((self.tail.load() + 1) % self.capacity as u32);
                        self.size.fetch_add(1);
                        self.generation.fetch_add(1);
                    }
                    self.mutex.unlock();
                    return written;
                }
                let g = self.generation.load();
                self.mutex.unlock();
                g
            };
            if !self.park(gen_before, deadline) {
                return Err(GonexError::QueueFull {
                    capacity: self.capacity,
                });
            }
        }
    }

    /// Blocking dequeue. `QueueEmpty` when the deadline passes with the
    /// queue still empty.
    pub fn dequeue_bytes(&self, timeout: Option<Duration>) -> GonexResult<Vec<u8>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let gen_before = {
                self.mutex.lock();
                if self.size.load() > 0 {
                    let data = self.read_slot(self.head.load() as usize);
                    if data.is_ok() {
                        self.head
                            .store((self.head.load() + 1) % self.capacity as u32);
                        self.size.fetch_sub(1);
                        self.generation.fetch_add(1);
                    }
                    self.mutex.unlock();
                    return data;
                }
                let g = self.generation.load();
                self.mutex.unlock();
                g
            };
            if !self.park(gen_before, deadline) {
                return Err(GonexError::QueueEmpty);
            }
        }
    }

    /// Non-blocking enqueue; `QueueFull` immediately when no slot is free.
    pub fn try_enqueue_bytes(&self, data: &[u8]) -> GonexResult<()> {
        self.check_item(data)?;
        self.mutex.lock();
        let result = if (self.size.load() as usize) < self.capacity {
            let r = self.write_slot(self.tail.load() as usize, data);
            if r.is_ok() {
                self.tail
                    .store((self.tail.load() + 1) % self.capacity as u32);
                self.size.fetch_add(1);
                self.generation.fetch_add(1);
            }
            r
        } else {
            Err(GonexError::QueueFull {
                capacity: self.capacity,
            })
        };
        self.mutex.unlock();
        result
    }

    /// Non-blocking dequeue; `QueueEmpty` immediately when nothing is
    /// queued.
    pub fn try_dequeue_bytes(&self) -> GonexResult<Vec<u8>> {
        self.mutex.lock();
        let result = if self.size.load() > 0 {
            let r = self.read_slot(self.head.load() as usize);
            if r.is_ok() {
                self.head
                    .store((self.head.load() + 1) % self.capacity as u32);
                self.size.fetch_sub(1);
                self.generation.fetch_add(1);
            }
            r
        } else {
            Err(GonexError::QueueEmpty)
        };
        self.mutex.unlock();
        result
    }

    /// Serialize and enqueue.
    pub fn enqueue<T: Serialize>(&self, value: &T, timeout: Option<Duration>) -> GonexResult<()> {
        let bytes = bincode::serialize(value).map_err(|e| GonexError::SerializationFailed {
            message: e.to_string(),
        })?;
        self.enqueue_bytes(&bytes, timeout)
    }

    /// Dequeue and deserialize.
    pub fn dequeue<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> GonexResult<T> {
        let bytes = self.dequeue_bytes(timeout)?;
        bincode::deserialize(&bytes).map_err(|e| GonexError::SerializationFailed {
            message: e.to_string(),
        })
    }

    fn check_item(&self, data: &[u8]) -> GonexResult<()> {
        if data.len() > self.max_item_size {
            return Err(GonexError::InvalidBufferSize {
                value: data.len() as i64,
            });
        }
        Ok(())
    }

    /// Park until the generation moves past `gen_before` or the deadline
    /// passes. `false` means the deadline won.
    fn park(&self, gen_before: u32, deadline: Option<Instant>) -> bool {
        let slice = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return false;
                }
                PARK_SLICE.min(d - now)
            }
            None => PARK_SLICE,
        };
        // A timed-out park is just a recheck; only the deadline ends the loop.
        self.generation.wait_until_changed(gen_before, Some(slice));
        match deadline {
            Some(d) => Instant::now() < d,
            None => true,
        }
    }

    fn slot_offset(&self, index: usize) -> usize {
        index * (4 + self.max_item_size)
    }

    fn write_slot(&self, index: usize, data: &[u8]) -> GonexResult<()> {
        let offset = self.slot_offset(index);
        self.buffer
            .write(offset, &(data.len() as u32).to_be_bytes())?;
        self.buffer.write(offset + 4, data)
    }

    fn read_slot(&self, index: usize) -> GonexResult<Vec<u8>> {
        let offset = self.slot_offset(index);
        let len_bytes = self.buffer.read(offset, 4)?;
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if len > self.max_item_size {
            return Err(GonexError::Internal {
                message: format!("corrupt slot length {len}"),
            });
        }
        self.buffer.read(offset + 4, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_bytes() {
        let q = SharedQueue::new(4, 16).unwrap();
        q.try_enqueue_bytes(b"one").unwrap();
        q.try_enqueue_bytes(b"two").unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_dequeue_bytes().unwrap(), b"one");
        assert_eq!(q.try_dequeue_bytes().unwrap(), b"two");
        assert!(q.is_empty());
    }

    #[test]
    fn test_try_variants_fail_fast() {
        let q = SharedQueue::new(1, 8).unwrap();
        q.try_enqueue_bytes(b"x").unwrap();
        assert_eq!(
            q.try_enqueue_bytes(b"y").unwrap_err().kind(),
            gonex_core::ErrorKind::QueueFull
        );
        q.try_dequeue_bytes().unwrap();
        assert_eq!(
            q.try_dequeue_bytes().unwrap_err().kind(),
            gonex_core::ErrorKind::QueueEmpty
        );
    }

    #[test]
    fn test_oversized_item_rejected() {
        let q = SharedQueue::new(2, 4).unwrap();
        assert_eq!(
            q.try_enqueue_bytes(b"too big").unwrap_err().kind(),
            gonex_core::ErrorKind::InvalidBufferSize
        );
    }

    #[test]
    fn test_blocking_dequeue_waits_for_producer() {
        let q = Arc::new(SharedQueue::new(2, 8).unwrap());
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.dequeue_bytes(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(30));
        q.try_enqueue_bytes(b"late").unwrap();
        assert_eq!(consumer.join().ok().and_then(|r| r.ok()), Some(b"late".to_vec()));
    }

    #[test]
    fn test_blocking_enqueue_timeout() {
        let q = SharedQueue::new(1, 8).unwrap();
        q.try_enqueue_bytes(b"full").unwrap();
        let err = q
            .enqueue_bytes(b"x", Some(Duration::from_millis(50)))
            .unwrap_err();
        assert_eq!(err.kind(), gonex_core::ErrorKind::QueueFull);
    }

    #[test]
    fn test_mpmc_all_items_observed_in_producer_order() {
        let q = Arc::new(SharedQueue::new(50, 16).unwrap());
        let mut producers = Vec::new();
        for p in 0u32..3 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0u32..20 {
                    q.enqueue(&(p, i), Some(Duration::from_secs(5))).unwrap();
                }
            }));
        }
        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut got: Vec<(u32, u32)> = Vec::new();
                for _ in 0..60 {
                    got.push(q.dequeue(Some(Duration::from_secs(5))).unwrap());
                }
                got
            })
        };
        for p in producers {
            p.join().ok();
        }
        let got = match consumer.join() {
            Ok(v) => v,
            Err(_) => panic!("consumer panicked"),
        };
        assert_eq!(got.len(), 60);
        assert_eq!(q.len(), 0);
        // Per-producer order is preserved even under interleaving.
        for p in 0..3 {
            let seq: Vec<u32> = got.iter().filter(|(pp, _)| *pp == p).map(|(_, i)| *i).collect();
            assert_eq!(seq, (0..20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let q = SharedQueue::new(2, 64).unwrap();
        q.enqueue(&("job", 7u64), None).unwrap();
        let (tag, n): (String, u64) = q.dequeue(None).unwrap();
        assert_eq!((tag.as_str(), n), ("job", 7));
    }
}
