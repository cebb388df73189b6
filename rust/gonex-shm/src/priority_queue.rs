//! Binary max-heap over shared memory, ordered by priority then arrival.
//!
//! Heap entries index fixed-size payload slots in a [`SharedMemoryBuffer`];
//! higher priority dequeues first, ties broken by earlier arrival. The heap
//! index lives behind the cell mutex, same discipline as the other
//! containers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use gonex_core::{GonexError, GonexResult};

use crate::atomic_cell::CellMutex;
use crate::buffer::{BufferFlags, SharedMemoryBuffer};

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    priority: u32,
    seq: u64,
    slot: usize,
    len: usize,
}

impl HeapEntry {
    /// Max-heap order: priority descending, then sequence ascending.
    fn outranks(&self, other: &HeapEntry) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.seq < other.seq)
    }
}

struct HeapState {
    heap: Vec<HeapEntry>,
    free_slots: Vec<usize>,
}

/// A bounded priority queue shared across threads.
pub struct SharedPriorityQueue {
    mutex: CellMutex,
    // Heap metadata guarded by `mutex`; the cell protocol is the lock.
    state: UnsafeCell<HeapState>,
    seq: AtomicU64,
    capacity: usize,
    max_item_size: usize,
    buffer: SharedMemoryBuffer,
}

// All access to `state` happens between mutex.lock() and mutex.unlock().
unsafe impl Send for SharedPriorityQueue {}
unsafe impl Sync for SharedPriorityQueue {}

impl SharedPriorityQueue {
    pub fn new(capacity: usize, max_item_size: usize) -> GonexResult<Self> {
        if capacity == 0 || max_item_size == 0 {
            return Err(GonexError::InvalidBufferSize { value: 0 });
        }
        Ok(Self {
            mutex: CellMutex::new(),
            state: UnsafeCell::new(HeapState {
                heap: Vec::with_capacity(capacity),
                free_slots: (0..capacity).rev().collect(),
            }),
            seq: AtomicU64::new(0),
            capacity,
            max_item_size,
            buffer: SharedMemoryBuffer::allocate(capacity * max_item_size, BufferFlags::empty()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.mutex.with(|| unsafe { &*self.state.get() }.heap.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert with a priority; `QueueFull` when every slot is taken.
    pub fn enqueue_bytes(&self, priority: u32, data: &[u8]) -> GonexResult<()> {
        if data.len() > self.max_item_size {
            return Err(GonexError::InvalidBufferSize {
                value: data.len() as i64,
            });
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.mutex.lock();
        let result = (|| {
            let st = unsafe { &mut *self.state.get() };
            let Some(slot) = st.free_slots.pop() else {
                return Err(GonexError::QueueFull {
                    capacity: self.capacity,
                });
            };
            self.buffer.write(slot * self.max_item_size, data)?;
            st.heap.push(HeapEntry {
                priority,
                seq,
                slot,
                len: data.len(),
            });
            let last_idx = st.heap.len() - 1;
            Self::bubble_up(&mut st.heap, last_idx);
            Ok(())
        })();
        self.mutex.unlock();
        result
    }

    /// Remove the highest-priority entry; `QueueEmpty` when there is none.
    pub fn dequeue_bytes(&self) -> GonexResult<(u32, Vec<u8>)> {
        self.mutex.lock();
        let result = (|| {
            let st = unsafe { &mut *self.state.get() };
            if st.heap.is_empty() {
                return Err(GonexError::QueueEmpty);
            }
            let last = st.heap.len() - 1;
            st.heap.swap(0, last);
            let root = st.heap.pop().ok_or(GonexError::QueueEmpty)?;
            if !st.heap.is_empty() {
                Self::bubble_down(&mut st.heap, 0);
            }
            let data = self.buffer.read(root.slot * self.max_item_size, root.len)?;
            st.free_slots.push(root.slot);
            Ok((root.priority, data))
        })();
        self.mutex.unlock();
        result
    }

    /// Priority of the entry that would dequeue next.
    pub fn peek_priority(&self) -> Option<u32> {
        self.mutex
            .with(|| unsafe { &*self.state.get() }.heap.first().map(|e| e.priority))
    }

    /// Serialize and insert.
    pub fn enqueue<T: Serialize>(&self, priority: u32, value: &T) -> GonexResult<()> {
        let bytes = bincode::serialize(value).map_err(|e| GonexError::SerializationFailed {
            message: e.to_string(),
        })?;
        self.enqueue_bytes(priority, &bytes)
    }

    /// Remove and deserialize the highest-priority entry.
    pub fn dequeue<T: DeserializeOwned>(&self) -> GonexResult<(u32, T)> {
        let (priority, bytes) = self.dequeue_bytes()?;
        let value = bincode::deserialize(&bytes).map_err(|e| GonexError::SerializationFailed {
            message: e.to_string(),
        })?;
        Ok((priority, value))
    }

    fn bubble_up(heap: &mut [HeapEntry], mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if heap[i].outranks(&heap[parent]) {
                heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn bubble_down(heap: &mut [HeapEntry], mut i: usize) {
        let n = heap.len();
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut best = i;
            if l < n && heap[l].outranks(&heap[best]) {
                best = l;
            }
            if r < n && heap[r].outranks(&heap[best]) {
                best = r;
            }
            if best == i {
                break;
            }
            heap.swap(i, best);
            i = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_higher_priority_first() {
        let pq = SharedPriorityQueue::new(8, 16).unwrap();
        pq.enqueue_bytes(1, b"low").unwrap();
        pq.enqueue_bytes(9, b"high").unwrap();
        pq.enqueue_bytes(5, b"mid").unwrap();
        assert_eq!(pq.dequeue_bytes().unwrap(), (9, b"high".to_vec()));
        assert_eq!(pq.dequeue_bytes().unwrap(), (5, b"mid".to_vec()));
        assert_eq!(pq.dequeue_bytes().unwrap(), (1, b"low".to_vec()));
    }

    #[test]
    fn test_ties_break_by_arrival() {
        let pq = SharedPriorityQueue::new(8, 16).unwrap();
        pq.enqueue_bytes(5, b"first").unwrap();
        pq.enqueue_bytes(5, b"second").unwrap();
        pq.enqueue_bytes(5, b"third").unwrap();
        assert_eq!(pq.dequeue_bytes().unwrap().1, b"first");
        assert_eq!(pq.dequeue_bytes().unwrap().1, b"second");
        assert_eq!(pq.dequeue_bytes().unwrap().1, b"third");
    }

    #[test]
    fn test_full_and_empty() {
        let pq = SharedPriorityQueue::new(2, 8).unwrap();
        pq.enqueue_bytes(1, b"a").unwrap();
        pq.enqueue_bytes(2, b"b").unwrap();
        assert_eq!(
            pq.enqueue_bytes(3, b"c").unwrap_err().kind(),
            gonex_core::ErrorKind::QueueFull
        );
        pq.dequeue_bytes().unwrap();
        pq.dequeue_bytes().unwrap();
        assert_eq!(
            pq.dequeue_bytes().unwrap_err().kind(),
            gonex_core::ErrorKind::QueueEmpty
        );
    }

    #[test]
    fn test_slot_reuse_after_dequeue() {
        let pq = SharedPriorityQueue::new(2, 8).unwrap();
        for round in 0..10u32 {
            pq.enqueue(round, &round).unwrap();
            let (_, got): (u32, u32) = pq.dequeue().unwrap();
            assert_eq!(got, round);
        }
        assert!(pq.is_empty());
    }

    #[test]
    fn test_concurrent_enqueue_preserves_heap_order() {
        let pq = Arc::new(SharedPriorityQueue::new(64, 16).unwrap());
        let mut handles = Vec::new();
        for t in 0u32..4 {
            let pq = pq.clone();
            handles.push(thread::spawn(move || {
                for i in 0u32..16 {
                    pq.enqueue(t * 16 + i, &(t * 16 + i)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().ok();
        }
        let mut last = u32::MAX;
        for _ in 0..64 {
            let (priority, _v): (u32, u32) = pq.dequeue().unwrap();
            assert!(priority <= last);
            last = priority;
        }
    }
}
