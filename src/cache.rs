// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Content-addressed LRU byte cache shared across reactors.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default cache budget: 10 MiB.
pub const DEFAULT_CACHE_CAPACITY: usize = 10 * 1024 * 1024;

fn time_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

struct CacheEntry {
    data: Vec<u8>,
    last_access: u64,
    touch_seq: u64,
}

struct CacheInner {
    mapping: HashMap<String, CacheEntry>,
    // ascending touch sequence = eviction order; the sequence is unique, so
    // order ties cannot occur
    recency: BTreeMap<u64, String>,
    occupancy: usize,
    next_seq: u64,
}

/// Byte-budgeted LRU cache, safe to use from every reactor thread.
///
/// A reader-writer lock guards the interior, but `try_load` takes it
/// exclusively even on a hit: recency is bumped on every successful load,
/// and that mutates the eviction order. The shared path is reserved for a
/// future look-without-touch mode.
pub struct Cache {
    capacity: usize,
    inner: RwLock<CacheInner>,
}

impl Cache {
    /// Creates a cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Creates a cache holding at most `capacity` payload bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(CacheInner {
                mapping: HashMap::new(),
                recency: BTreeMap::new(),
                occupancy: 0,
                next_seq: 0,
            }),
        }
    }

    /// The configured byte budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes currently cached.
    pub fn occupancy(&self) -> usize {
        self.inner.read().map_or(0, |inner| inner.occupancy)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.read().map_or(0, |inner| inner.mapping.len())
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// On a hit, appends the payload to `destination`, marks the entry
    /// most-recently used, and returns true.
    pub fn try_load(&self, key: &str, destination: &mut Vec<u8>) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            log::error!("cache: could not take a lock on mutex");
            return false;
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let old_seq = match inner.mapping.get_mut(key) {
            Some(entry) => {
                destination.extend_from_slice(&entry.data);
                let old_seq = entry.touch_seq;
                entry.touch_seq = seq;
                entry.last_access = time_utc_ms();
                old_seq
            }
            None => return false,
        };
        inner.recency.remove(&old_seq);
        inner.recency.insert(seq, key.to_owned());
        true
    }

    /// Inserts `data` under `key` at the most-recent position, evicting
    /// least-recently-used entries until it fits. Refuses (returns false)
    /// when the key already exists or the payload alone exceeds the
    /// capacity; existing entries are untouched in either case.
    pub fn try_insert(&self, key: &str, data: &[u8]) -> bool {
        if data.len() > self.capacity {
            return false;
        }
        let Ok(mut inner) = self.inner.write() else {
            log::error!("cache: could not take a lock on mutex");
            return false;
        };
        if inner.mapping.contains_key(key) {
            return false;
        }
        while inner.occupancy + data.len() > self.capacity && !inner.recency.is_empty() {
            evict_one(&mut inner);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.occupancy += data.len();
        inner.recency.insert(seq, key.to_owned());
        inner.mapping.insert(
            key.to_owned(),
            CacheEntry {
                data: data.to_vec(),
                last_access: time_utc_ms(),
                touch_seq: seq,
            },
        );
        true
    }

    /// Last-access wall-clock timestamp of an entry, in milliseconds.
    pub fn last_access(&self, key: &str) -> Option<u64> {
        let inner = self.inner.read().ok()?;
        inner.mapping.get(key).map(|entry| entry.last_access)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let Ok(mut inner) = self.inner.write() else {
            log::error!("cache: could not take a lock on mutex");
            return;
        };
        inner.mapping.clear();
        inner.recency.clear();
        inner.occupancy = 0;
    }
}

fn evict_one(inner: &mut CacheInner) {
    let Some((&seq, _)) = inner.recency.iter().next() else {
        return;
    };
    if let Some(key) = inner.recency.remove(&seq) {
        if let Some(entry) = inner.mapping.remove(&key) {
            inner.occupancy -= entry.data.len();
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.capacity)
            .field("occupancy", &self.occupancy())
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn loads_what_was_inserted() {
        let cache = Cache::with_capacity(1024);
        assert!(cache.try_insert("k", b"payload"));
        let mut out = Vec::new();
        assert!(cache.try_load("k", &mut out));
        assert_eq!(out, b"payload");
        assert_eq!(cache.occupancy(), 7);
    }

    #[test]
    fn refuses_duplicate_keys() {
        let cache = Cache::with_capacity(1024);
        assert!(cache.try_insert("k", b"one"));
        assert!(!cache.try_insert("k", b"two"));
        let mut out = Vec::new();
        assert!(cache.try_load("k", &mut out));
        assert_eq!(out, b"one");
    }

    #[test]
    fn refuses_oversize_payloads_without_disturbing_entries() {
        let cache = Cache::with_capacity(8);
        assert!(cache.try_insert("small", b"1234"));
        assert!(!cache.try_insert("big", b"123456789"));
        assert_eq!(cache.occupancy(), 4);
        let mut out = Vec::new();
        assert!(cache.try_load("small", &mut out));
    }

    #[test]
    fn evicts_least_recently_used_first() {
        // capacity fits three entries of 100 bytes, not four
        let cache = Cache::with_capacity(300);
        let chunk = [0u8; 100];
        assert!(cache.try_insert("a", &chunk));
        assert!(cache.try_insert("b", &chunk));
        assert!(cache.try_insert("c", &chunk));

        assert!(cache.try_insert("d", &chunk));
        let mut out = Vec::new();
        assert!(!cache.try_load("a", &mut out), "a was least recent");

        // touching b makes c the next victim
        out.clear();
        assert!(cache.try_load("b", &mut out));
        assert!(cache.try_insert("e", &chunk));
        out.clear();
        assert!(!cache.try_load("c", &mut out), "c was least recent");
        out.clear();
        assert!(cache.try_load("b", &mut out));
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = Cache::with_capacity(1024);
        assert!(cache.try_insert("k", b"payload"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.occupancy(), 0);
        let mut out = Vec::new();
        assert!(!cache.try_load("k", &mut out));
    }

    #[test]
    fn concurrent_loads_and_inserts_agree() {
        let cache = Arc::new(Cache::with_capacity(1 << 20));
        assert!(cache.try_insert("shared", b"content"));

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for round in 0..100 {
                        let mut out = Vec::new();
                        assert!(cache.try_load("shared", &mut out));
                        assert_eq!(out, b"content");
                        cache.try_insert(&format!("t{i}-{round}"), b"x");
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut out = Vec::new();
        assert!(cache.try_load("shared", &mut out));
    }
}
