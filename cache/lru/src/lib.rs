//! Capacity-bounded key/value store with LRU eviction and CAS semantics.
//!
//! Lookups go through a hash map; recency ordering lives in a linked list
//! of keys backed by a slab arena. Every external operation takes a single
//! mutex for its whole duration, so the cache is linearizable as a unit.
//!
//! Entries own the raw request packet they were stored from and are handed
//! out with shared ownership: a reader holding an entry keeps its storage
//! alive even after eviction or deletion.

mod entry;
mod error;
mod list;

pub use entry::Entry;
pub use error::CacheError;

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use parking_lot::Mutex;
use protocol_memcache::{HEADER_LEN, MAX_KEY_LEN, MAX_VALUE_LEN};
use tracing::debug;

use crate::list::LruList;

/// Default capacity: 64 MiB.
pub const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;

/// When an insert would exceed capacity, reclaim this multiple of the new
/// entry's size before inserting.
const RECLAIM_FACTOR: usize = 5;

/// Thread-safe LRU cache.
pub struct LruCache {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    /// Resident bytes: the sum of stored packet lengths.
    size: usize,
    map: HashMap<Bytes, Arc<Entry>, RandomState>,
    lru: LruList,
}

impl LruCache {
    /// Create a cache bounded to `capacity` bytes. A capacity of zero
    /// selects [`DEFAULT_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };

        // Reserve for twice the number of max-sized entries.
        let unit = HEADER_LEN + MAX_VALUE_LEN + MAX_KEY_LEN;
        let items = 2 * (capacity / unit);

        LruCache {
            inner: Mutex::new(Inner {
                capacity,
                size: 0,
                map: HashMap::with_capacity_and_hasher(items, RandomState::new()),
                lru: LruList::new(),
            }),
        }
    }

    /// Look up a key, promoting it to most recently used on a hit.
    ///
    /// The returned entry remains valid after eviction or deletion; readers
    /// must not rely on it still being resident.
    pub fn get(&self, key: &[u8]) -> Option<Arc<Entry>> {
        let mut inner = self.inner.lock();

        let entry = inner.map.get(key)?.clone();
        inner.lru.move_to_back(entry.lru_node());
        Some(entry)
    }

    /// Store an entry, replacing any existing entry for the same key.
    ///
    /// If the insert would push resident size past capacity, entries are
    /// evicted from the least-recent end first. A single entry larger than
    /// the whole capacity is still accepted once the cache has drained.
    pub fn set(&self, entry: Entry) {
        let mut inner = self.inner.lock();
        inner.set(entry);
    }

    /// Compare-and-swap store.
    ///
    /// A zero token behaves exactly like [`set`](Self::set) and succeeds.
    /// Otherwise the store only proceeds when no prior entry exists for the
    /// key or the prior entry's stored CAS token equals `token`.
    pub fn cas(&self, entry: Entry, token: u64) -> bool {
        let mut inner = self.inner.lock();

        if token > 0 {
            if let Some(prior) = inner.map.get(&entry.key()) {
                if prior.cas() != token {
                    return false;
                }
            }
        }

        inner.set(entry);
        true
    }

    /// Remove a key.
    ///
    /// With `token > 0`, the removal is refused when an entry exists whose
    /// stored CAS token differs. Returns whether an entry was removed.
    pub fn remove(&self, key: &[u8], token: u64) -> bool {
        let mut inner = self.inner.lock();

        if token > 0 {
            if let Some(prior) = inner.map.get(key) {
                if prior.cas() != token {
                    return false;
                }
            }
        }

        inner.delete(key).is_some()
    }

    /// Number of resident entries.
    pub fn count(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Resident bytes (sum of stored packet lengths).
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.lru.clear();
        inner.size = 0;
    }

    /// Clear the cache and reset its capacity. Intended for tests.
    pub fn rehash(&self, capacity: usize) {
        assert!(capacity > 0);
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.lru.clear();
        inner.size = 0;
        inner.capacity = capacity;
    }

    /// Assert the internal invariants: the map and the recency list hold
    /// the same key set, and `size` equals the sum of resident packet
    /// lengths. Panics on violation.
    pub fn verify(&self) {
        let inner = self.inner.lock();

        assert_eq!(inner.map.len(), inner.lru.len(), "map/LRU length mismatch");
        assert_eq!(inner.lru.is_empty(), inner.map.is_empty());

        let mut total = 0;
        let mut keys = Vec::with_capacity(inner.lru.len());
        for key in inner.lru.iter() {
            let entry = inner
                .map
                .get(key)
                .unwrap_or_else(|| panic!("LRU key missing from map: {:?}", key));
            assert_eq!(&entry.key(), key, "entry key mismatch");
            total += entry.packet_len();
            keys.push(key);
        }
        assert_eq!(inner.size, total, "size accounting mismatch");
        assert_eq!(inner.lru.front(), keys.first().copied(), "front mismatch");
        assert_eq!(inner.lru.back(), keys.last().copied(), "back mismatch");
    }

    /// Keys in recency order, least recent first.
    #[cfg(test)]
    fn lru_keys(&self) -> Vec<Bytes> {
        self.inner.lock().lru.iter().cloned().collect()
    }
}

impl Default for LruCache {
    fn default() -> Self {
        LruCache::new(DEFAULT_CAPACITY)
    }
}

impl Inner {
    fn set(&mut self, mut entry: Entry) {
        let key = entry.key();

        if self.map.contains_key(&key) {
            self.delete(&key);
        }

        let mem = entry.packet_len();
        if self.size + mem > self.capacity {
            self.reclaim(RECLAIM_FACTOR * mem);
        }

        let node = self.lru.push_back(key.clone());
        entry.set_lru_node(node);
        self.map.insert(key, Arc::new(entry));
        self.size += mem;
    }

    fn delete(&mut self, key: &[u8]) -> Option<usize> {
        let entry = self.map.remove(key)?;
        self.lru.remove(entry.lru_node());
        let mem = entry.packet_len();
        self.size -= mem;
        Some(mem)
    }

    /// Evict from the least-recent end until `target` bytes are freed or
    /// the cache is empty.
    fn reclaim(&mut self, target: usize) {
        let mut freed = 0;
        while freed < target {
            let key = match self.lru.front() {
                Some(key) => key.clone(),
                None => break,
            };
            match self.delete(&key) {
                Some(mem) => {
                    debug!(key = ?key, bytes = mem, "evicted entry");
                    freed += mem;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use protocol_memcache::{Request, RequestHeader};

    fn build_entry(key: &str, value: &str, cas: u64) -> Entry {
        let mut buf = BytesMut::new();
        Request::set(key.as_bytes(), value.as_bytes())
            .cas(cas)
            .encode(&mut buf);
        let packet = buf.freeze();
        let header = RequestHeader::decode(&packet);
        Entry::new(packet, header).unwrap()
    }

    fn set(cache: &LruCache, key: &str, value: &str) {
        cache.set(build_entry(key, value, 0));
    }

    fn get_value(cache: &LruCache, key: &str) -> Option<Vec<u8>> {
        cache.get(key.as_bytes()).map(|e| e.value().to_vec())
    }

    #[test]
    fn set_then_get() {
        let cache = LruCache::default();
        set(&cache, "k1", "v1");

        assert_eq!(cache.count(), 1);
        assert_eq!(get_value(&cache, "k1").unwrap(), b"v1");
        assert_eq!(get_value(&cache, "missing"), None);
        cache.verify();
    }

    #[test]
    fn set_replaces_existing() {
        let cache = LruCache::default();
        set(&cache, "k", "old");
        set(&cache, "k", "new value");

        assert_eq!(cache.count(), 1);
        assert_eq!(get_value(&cache, "k").unwrap(), b"new value");
        cache.verify();
    }

    #[test]
    fn size_tracks_packet_lengths() {
        let cache = LruCache::default();
        let e1 = build_entry("k1", "v1", 0);
        let e2 = build_entry("k2", "a longer value", 0);
        let expected = e1.packet_len() + e2.packet_len();

        cache.set(e1);
        cache.set(e2);
        assert_eq!(cache.size(), expected);

        // removal decrements by the entry's true packet length
        assert!(cache.remove(b"k2", 0));
        let remaining = build_entry("k1", "v1", 0).packet_len();
        assert_eq!(cache.size(), remaining);
        cache.verify();

        assert!(cache.remove(b"k1", 0));
        assert_eq!(cache.size(), 0);
        cache.verify();
    }

    #[test]
    fn lru_eviction_keeps_recent_half() {
        let cache = LruCache::default();
        let packet_len = build_entry("key_0", "val_0", 0).packet_len();
        cache.rehash(5 * packet_len);

        for i in 0..10 {
            set(&cache, &format!("key_{}", i), &format!("val_{}", i));
        }

        assert_eq!(cache.count(), 5);
        for i in 0..5 {
            assert_eq!(get_value(&cache, &format!("key_{}", i)), None);
        }
        for i in 5..10 {
            let value = get_value(&cache, &format!("key_{}", i)).unwrap();
            assert_eq!(value, format!("val_{}", i).into_bytes());
        }
        cache.verify();
    }

    #[test]
    fn capacity_bound_holds_after_set() {
        let cache = LruCache::default();
        let packet_len = build_entry("key_0", "val_0", 0).packet_len();
        cache.rehash(3 * packet_len);

        for i in 0..20 {
            set(&cache, &format!("key_{}", i), &format!("val_{}", i));
            assert!(cache.size() <= cache.capacity());
            cache.verify();
        }
    }

    #[test]
    fn oversized_entry_accepted_after_drain() {
        let cache = LruCache::default();
        cache.rehash(64);

        set(&cache, "small", "x");
        set(&cache, "big", &"y".repeat(200));

        // one entry larger than the whole capacity
        assert_eq!(cache.count(), 1);
        assert!(cache.size() > cache.capacity());
        assert!(get_value(&cache, "big").is_some());
        cache.verify();
    }

    #[test]
    fn get_promotes_to_most_recent() {
        let cache = LruCache::default();
        set(&cache, "a", "1");
        set(&cache, "b", "2");
        set(&cache, "c", "3");

        assert!(cache.get(b"a").is_some());
        let keys = cache.lru_keys();
        assert_eq!(keys.last().unwrap(), "a");
        assert_eq!(keys.first().unwrap(), "b");

        set(&cache, "b", "2'");
        let keys = cache.lru_keys();
        assert_eq!(keys.last().unwrap(), "b");
        cache.verify();
    }

    #[test]
    fn eviction_follows_access_order() {
        let cache = LruCache::default();
        let packet_len = build_entry("key_0", "val_0", 0).packet_len();
        cache.rehash(10 * packet_len);

        for i in 0..10 {
            set(&cache, &format!("key_{}", i), &format!("val_{}", i));
        }

        // touch key_0 so the reclaim pass walks past it
        assert!(cache.get(b"key_0").is_some());
        set(&cache, "key_x", "val_x");

        // the insert reclaims five entries: the least recent ones are now
        // key_1..key_5, since key_0 was promoted
        assert_eq!(cache.count(), 6);
        assert!(get_value(&cache, "key_0").is_some());
        for i in 1..=5 {
            assert_eq!(get_value(&cache, &format!("key_{}", i)), None);
        }
        for i in 6..10 {
            assert!(get_value(&cache, &format!("key_{}", i)).is_some());
        }
        assert!(get_value(&cache, "key_x").is_some());
        cache.verify();
    }

    #[test]
    fn cas_semantics() {
        let cache = LruCache::default();
        cache.set(build_entry("k", "a", 999));

        // mismatched token leaves the entry untouched
        assert!(!cache.cas(build_entry("k", "b", 999), 1000));
        assert_eq!(get_value(&cache, "k").unwrap(), b"a");

        // matching token replaces
        assert!(cache.cas(build_entry("k", "b", 999), 999));
        assert_eq!(get_value(&cache, "k").unwrap(), b"b");

        // token against a missing key stores
        assert!(cache.cas(build_entry("fresh", "v", 0), 123));
        assert_eq!(get_value(&cache, "fresh").unwrap(), b"v");

        // zero token always behaves as set
        assert!(cache.cas(build_entry("k", "c", 0), 0));
        assert_eq!(get_value(&cache, "k").unwrap(), b"c");
        cache.verify();
    }

    #[test]
    fn remove_with_cas() {
        let cache = LruCache::default();
        cache.set(build_entry("k", "v", 999));

        assert!(!cache.remove(b"k", 1000));
        assert!(cache.get(b"k").is_some());

        assert!(cache.remove(b"k", 999));
        assert!(cache.get(b"k").is_none());
        cache.verify();
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = LruCache::default();
        set(&cache, "k", "v");

        assert!(cache.remove(b"k", 0));
        assert!(!cache.remove(b"k", 0));
        assert!(!cache.remove(b"never", 0));
        cache.verify();
    }

    #[test]
    fn entry_outlives_removal() {
        let cache = LruCache::default();
        set(&cache, "k", "payload");

        let held = cache.get(b"k").unwrap();
        assert!(cache.remove(b"k", 0));
        assert_eq!(cache.count(), 0);

        // the reader's handle still resolves
        assert_eq!(held.value(), b"payload");
    }

    #[test]
    fn clear_and_rehash_reset() {
        let cache = LruCache::default();
        for i in 0..10 {
            set(&cache, &format!("key_{}", i), "v");
        }
        assert_eq!(cache.count(), 10);

        cache.clear();
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.size(), 0);
        cache.verify();

        set(&cache, "k", "v");
        cache.rehash(1024);
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.capacity(), 1024);
        cache.verify();
    }

    #[test]
    fn concurrent_access() {
        use std::thread;

        let cache = Arc::new(LruCache::default());
        let mut handles = Vec::new();

        for id in 0..10 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                for i in 0..10 {
                    let key = format!("key_{}_{}", id, i);
                    let value = format!("val_{}_{}", id, i);
                    cache.set(build_entry(&key, &value, 0));
                }
                for i in 0..10 {
                    let key = format!("key_{}_{}", id, i);
                    let value = format!("val_{}_{}", id, i);
                    let entry = cache.get(key.as_bytes()).unwrap();
                    assert_eq!(entry.value(), value.as_bytes());
                }
                for i in 0..10 {
                    let key = format!("key_{}_{}", id, i);
                    assert!(cache.remove(key.as_bytes(), 0));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.count(), 0);
        cache.verify();
    }
}
