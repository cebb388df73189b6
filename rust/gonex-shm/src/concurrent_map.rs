//! Segmented hash map: entries partitioned across independently locked
//! segments.
//!
//! Keys hash to a segment by modulus; each segment is a chained table under
//! its own cell mutex. Batch operations group keys by segment so each
//! segment lock is taken once per batch. Size counters are recomputed on
//! query under the per-segment locks.

use std::cell::UnsafeCell;
use std::hash::{BuildHasher, Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::Serialize;

use gonex_core::{GonexError, GonexResult};

use crate::atomic_cell::CellMutex;
use crate::map::ChainedTable;

/// Hard cap on segment count.
pub const MAX_SEGMENTS: usize = 64;

/// Per-segment view reported by [`ConcurrentHashMap::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub index: usize,
    pub size: usize,
    pub buckets: usize,
}

/// Aggregate view reported by [`ConcurrentHashMap::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrentMapStats {
    pub total_size: usize,
    pub segment_count: usize,
    pub segments: Vec<SegmentStats>,
}

struct Segment {
    mutex: CellMutex,
    // Guarded by `mutex`; the cell protocol is the lock.
    table: UnsafeCell<ChainedTable>,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// A byte-valued hash map partitioned across up to [`MAX_SEGMENTS`]
/// independently locked segments.
pub struct ConcurrentHashMap {
    segments: Vec<Segment>,
    hasher: ahash::RandomState,
}

impl ConcurrentHashMap {
    /// `segment_count` is clamped to `[1, MAX_SEGMENTS]`;
    /// `buckets_per_segment` and `max_entries_per_segment` size each
    /// segment's table.
    pub fn new(
        segment_count: usize,
        buckets_per_segment: usize,
        max_entries_per_segment: usize,
    ) -> GonexResult<Self> {
        if segment_count == 0 || segment_count > MAX_SEGMENTS {
            return Err(GonexError::InvalidConcurrency {
                value: segment_count as i64,
            });
        }
        let segments = (0..segment_count)
            .map(|i| Segment {
                mutex: CellMutex::new(),
                table: UnsafeCell::new(ChainedTable::new(
                    buckets_per_segment,
                    max_entries_per_segment,
                    0.75,
                    format!("concurrent-map-segment-{i}"),
                )),
            })
            .collect();
        Ok(Self {
            segments,
            hasher: ahash::RandomState::new(),
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn hash_key(&self, key: &str) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    fn segment_of(&self, hash: u64) -> usize {
        (hash % self.segments.len() as u64) as usize
    }

    pub fn set(&self, key: &str, value: &[u8]) -> GonexResult<()> {
        let hash = self.hash_key(key);
        let seg = &self.segments[self.segment_of(hash)];
        seg.mutex.lock();
        let r = unsafe { &mut *seg.table.get() }.set(hash, key, value);
        seg.mutex.unlock();
        r
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let hash = self.hash_key(key);
        let seg = &self.segments[self.segment_of(hash)];
        seg.mutex
            .with(|| unsafe { &*seg.table.get() }.get(hash, key))
    }

    pub fn delete(&self, key: &str) -> bool {
        let hash = self.hash_key(key);
        let seg = &self.segments[self.segment_of(hash)];
        seg.mutex
            .with(|| unsafe { &mut *seg.table.get() }.delete(hash, key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Total size, recomputed under the per-segment locks.
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|seg| seg.mutex.with(|| unsafe { &*seg.table.get() }.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch lookup: keys grouped by segment, each segment locked once.
    /// Results come back in input order.
    pub fn batch_get(&self, keys: &[&str]) -> Vec<Option<Vec<u8>>> {
        let mut grouped: Vec<Vec<(usize, u64)>> = vec![Vec::new(); self.segments.len()];
        for (pos, key) in keys.iter().enumerate() {
            let hash = self.hash_key(key);
            grouped[self.segment_of(hash)].push((pos, hash));
        }
        let mut out: Vec<Option<Vec<u8>>> = vec![None; keys.len()];
        for (seg_idx, group) in grouped.iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let seg = &self.segments[seg_idx];
            seg.mutex.lock();
            let table = unsafe { &*seg.table.get() };
            for &(pos, hash) in group {
                out[pos] = table.get(hash, keys[pos]);
            }
            seg.mutex.unlock();
        }
        out
    }

    /// Batch insert: entries grouped by segment, each segment locked once.
    /// Stops at the first failing entry and reports it.
    pub fn batch_set(&self, entries: &[(&str, &[u8])]) -> GonexResult<()> {
        let mut grouped: Vec<Vec<(usize, u64)>> = vec![Vec::new(); self.segments.len()];
        for (pos, (key, _)) in entries.iter().enumerate() {
            let hash = self.hash_key(key);
            grouped[self.segment_of(hash)].push((pos, hash));
        }
        for (seg_idx, group) in grouped.iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let seg = &self.segments[seg_idx];
            seg.mutex.lock();
            let table = unsafe { &mut *seg.table.get() };
            for &(pos, hash) in group {
                let (key, value) = entries[pos];
                if let Err(e) = table.set(hash, key, value) {
                    seg.mutex.unlock();
                    return Err(e);
                }
            }
            seg.mutex.unlock();
        }
        Ok(())
    }

    /// Aggregate stats gathered under the per-segment locks.
    pub fn stats(&self) -> ConcurrentMapStats {
        let segments: Vec<SegmentStats> = self
            .segments
            .iter()
            .enumerate()
            .map(|(index, seg)| {
                seg.mutex.with(|| {
                    let table = unsafe { &*seg.table.get() };
                    SegmentStats {
                        index,
                        size: table.len(),
                        buckets: table.bucket_count(),
                    }
                })
            })
            .collect();
        ConcurrentMapStats {
            total_size: segments.iter().map(|s| s.size).sum(),
            segment_count: self.segments.len(),
            segments,
        }
    }

    /// Serialize and insert.
    pub fn set_value<T: Serialize>(&self, key: &str, value: &T) -> GonexResult<()> {
        let bytes = bincode::serialize(value).map_err(|e| GonexError::SerializationFailed {
            message: e.to_string(),
        })?;
        self.set(key, &bytes)
    }

    /// Look up and deserialize.
    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> GonexResult<Option<T>> {
        match self.get(key) {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| GonexError::SerializationFailed {
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}
