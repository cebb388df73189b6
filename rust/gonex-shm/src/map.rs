//! Chained hash map under a single cell mutex.
//!
//! Bucket heads index into an entries array; collisions chain through a
//! `next` index. Crossing the load-factor threshold is diagnosed (a warning
//! and [`SharedMap::needs_resize`]) rather than actively redistributed;
//! inserts beyond `max_entries` fail.

use std::cell::UnsafeCell;
use std::hash::{BuildHasher, Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use gonex_core::{GonexError, GonexResult};

use crate::atomic_cell::CellMutex;

pub(crate) const NO_ENTRY: i32 = -1;

pub(crate) struct MapEntry {
    hash: u64,
    key: String,
    value: Vec<u8>,
    next: i32,
}

/// The chained-table core shared by [`SharedMap`] and the segmented map.
/// Callers provide the locking.
pub(crate) struct ChainedTable {
    buckets: Vec<i32>,
    entries: Vec<Option<MapEntry>>,
    free: Vec<usize>,
    size: usize,
    needs_resize: bool,
    load_factor_threshold: f64,
    name: String,
}

impl ChainedTable {
    pub(crate) fn new(
        bucket_count: usize,
        max_entries: usize,
        load_factor_threshold: f64,
        name: String,
    ) -> Self {
        Self {
            buckets: vec![NO_ENTRY; bucket_count.max(1)],
            entries: (0..max_entries).map(|_| None).collect(),
            free: (0..max_entries).rev().collect(),
            size: 0,
            needs_resize: false,
            load_factor_threshold,
            name,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    pub(crate) fn needs_resize(&self) -> bool {
        self.needs_resize
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    pub(crate) fn set(&mut self, hash: u64, key: &str, value: &[u8]) -> GonexResult<()> {
        let bucket = self.bucket_of(hash);
        // Exactly one entry per key: replace in place when present.
        let mut idx = self.buckets[bucket];
        while idx != NO_ENTRY {
            let entry = self.entries[idx as usize]
                .as_mut()
                .ok_or_else(|| corrupt_chain(&self.name))?;
            if entry.hash == hash && entry.key == key {
                entry.value = value.to_vec();
                return Ok(());
            }
            idx = entry.next;
        }
        let Some(slot) = self.free.pop() else {
            return Err(GonexError::MapFull {
                capacity: self.entries.len(),
            });
        };
        self.entries[slot] = Some(MapEntry {
            hash,
            key: key.to_string(),
            value: value.to_vec(),
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = slot as i32;
        self.size += 1;
        let load = self.size as f64 / self.buckets.len() as f64;
        if load > self.load_factor_threshold && !self.needs_resize {
            self.needs_resize = true;
            warn!(
                map = %self.name,
                size = self.size,
                buckets = self.buckets.len(),
                load_factor = load,
                "load factor above threshold; lookups will degrade until recreated larger"
            );
        }
        Ok(())
    }

    pub(crate) fn get(&self, hash: u64, key: &str) -> Option<Vec<u8>> {
        let mut idx = self.buckets[self.bucket_of(hash)];
        while idx != NO_ENTRY {
            let entry = self.entries[idx as usize].as_ref()?;
            if entry.hash == hash && entry.key == key {
                return Some(entry.value.clone());
            }
            idx = entry.next;
        }
        None
    }

    pub(crate) fn delete(&mut self, hash: u64, key: &str) -> bool {
        let bucket = self.bucket_of(hash);
        let mut prev: i32 = NO_ENTRY;
        let mut idx = self.buckets[bucket];
        while idx != NO_ENTRY {
            let (matches, next) = match self.entries[idx as usize].as_ref() {
                Some(e) => (e.hash == hash && e.key == key, e.next),
                None => return false,
            };
            if matches {
                if prev == NO_ENTRY {
                    self.buckets[bucket] = next;
                } else if let Some(p) = self.entries[prev as usize].as_mut() {
                    p.next = next;
                }
                self.entries[idx as usize] = None;
                self.free.push(idx as usize);
                self.size -= 1;
                return true;
            }
            prev = idx;
            idx = next;
        }
        false
    }

    pub(crate) fn contains(&self, hash: u64, key: &str) -> bool {
        self.get(hash, key).is_some()
    }
}

fn corrupt_chain(name: &str) -> GonexError {
    GonexError::Internal {
        message: format!("map '{name}': bucket chain references an empty slot"),
    }
}

/// Options accepted by [`SharedMap::with_options`].
#[derive(Debug, Clone)]
pub struct SharedMapOptions {
    /// Bucket array length.
    pub bucket_count: usize,
    /// Hard cap on stored entries.
    pub max_entries: usize,
    /// Load factor above which the map diagnoses overflow.
    pub load_factor_threshold: f64,
    pub name: Option<String>,
}

impl Default for SharedMapOptions {
    fn default() -> Self {
        Self {
            bucket_count: 64,
            max_entries: 1024,
            load_factor_threshold: 0.75,
            name: None,
        }
    }
}

/// A byte-valued hash map shared across threads, guarded by one cell mutex.
pub struct SharedMap {
    mutex: CellMutex,
    // Guarded by `mutex`; the cell protocol is the lock.
    table: UnsafeCell<ChainedTable>,
    hasher: ahash::RandomState,
}

unsafe impl Send for SharedMap {}
unsafe impl Sync for SharedMap {}

impl SharedMap {
    pub fn new() -> Self {
        Self::with_options(SharedMapOptions::default())
    }

    pub fn with_options(options: SharedMapOptions) -> Self {
        Self {
            mutex: CellMutex::new(),
            table: UnsafeCell::new(ChainedTable::new(
                options.bucket_count,
                options.max_entries,
                options.load_factor_threshold,
                options.name.unwrap_or_else(|| "shared-map".to_string()),
            )),
            hasher: ahash::RandomState::new(),
        }
    }

    fn hash_key(&self, key: &str) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    /// Insert or replace. `MapFull` at the entry cap.
    pub fn set(&self, key: &str, value: &[u8]) -> GonexResult<()> {
        let hash = self.hash_key(key);
        self.mutex.lock();
        let r = unsafe { &mut *self.table.get() }.set(hash, key, value);
        self.mutex.unlock();
        r
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let hash = self.hash_key(key);
        self.mutex.with(|| unsafe { &*self.table.get() }.get(hash, key))
    }

    /// Remove a key; `true` when it was present.
    pub fn delete(&self, key: &str) -> bool {
        let hash = self.hash_key(key);
        self.mutex
            .with(|| unsafe { &mut *self.table.get() }.delete(hash, key))
    }

    pub fn contains(&self, key: &str) -> bool {
        let hash = self.hash_key(key);
        self.mutex
            .with(|| unsafe { &*self.table.get() }.contains(hash, key))
    }

    pub fn len(&self) -> usize {
        self.mutex.with(|| unsafe { &*self.table.get() }.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the load factor has crossed the configured threshold.
    pub fn needs_resize(&self) -> bool {
        self.mutex
            .with(|| unsafe { &*self.table.get() }.needs_resize())
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

impl Default for SharedMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_get_delete() {
        let map = SharedMap::new();
        map.set("alpha", b"1").unwrap();
        map.set("beta", b"2").unwrap();
        assert_eq!(map.get("alpha"), Some(b"1".to_vec()));
        assert_eq!(map.len(), 2);
        assert!(map.delete("alpha"));
        assert_eq!(map.get("alpha"), None);
        assert!(!map.delete("alpha"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_replace_keeps_one_entry_per_key() {
        let map = SharedMap::new();
        map.set("k", b"old").unwrap();
        map.set("k", b"new").unwrap();
        assert_eq!(map.get("k"), Some(b"new".to_vec()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_chaining_under_few_buckets() {
        let map = SharedMap::with_options(SharedMapOptions {
            bucket_count: 2,
            max_entries: 64,
            load_factor_threshold: 100.0,
            name: None,
        });
        for i in 0..32 {
            map.set(&format!("key-{i}"), format!("v{i}").as_bytes()).unwrap();
        }
        for i in 0..32 {
            assert_eq!(map.get(&format!("key-{i}")), Some(format!("v{i}").into_bytes()));
        }
        assert!(map.delete("key-17"));
        assert_eq!(map.get("key-17"), None);
        assert_eq!(map.get("key-16"), Some(b"v16".to_vec()));
        assert_eq!(map.len(), 31);
    }

    #[test]
    fn test_map_full() {
        let map = SharedMap::with_options(SharedMapOptions {
            bucket_count: 4,
            max_entries: 2,
            load_factor_threshold: 100.0,
            name: None,
        });
        map.set("a", b"1").unwrap();
        map.set("b", b"2").unwrap();
        assert_eq!(
            map.set("c", b"3").unwrap_err().kind(),
            gonex_core::ErrorKind::MapFull
        );
        // Replacing an existing key still works at capacity.
        map.set("a", b"9").unwrap();
    }

    #[test]
    fn test_needs_resize_diagnosed_not_performed() {
        let map = SharedMap::with_options(SharedMapOptions {
            bucket_count: 4,
            max_entries: 64,
            load_factor_threshold: 0.75,
            name: None,
        });
        assert!(!map.needs_resize());
        for i in 0..4 {
            map.set(&format!("k{i}"), b"v").unwrap();
        }
        assert!(map.needs_resize());
        // Still functional past the threshold.
        map.set("extra", b"v").unwrap();
        assert_eq!(map.get("extra"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_concurrent_writers() {
        let map = Arc::new(SharedMap::with_options(SharedMapOptions {
            bucket_count: 64,
            max_entries: 4096,
            load_factor_threshold: 100.0,
            name: None,
        }));
        let mut handles = Vec::new();
        for t in 0..4 {
            let map = map.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    map.set(&format!("t{t}-{i}"), &[t as u8, i as u8]).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().ok();
        }
        assert_eq!(map.len(), 400);
        assert_eq!(map.get("t3-99"), Some(vec![3, 99]));
    }

    #[test]
    fn test_serde_values() {
        let map = SharedMap::new();
        map.set_value("pair", &(1u32, "two")).unwrap();
        let got: Option<(u32, String)> = map.get_value("pair").unwrap();
        assert_eq!(got, Some((1, "two".to_string())));
    }
}
